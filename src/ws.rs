use futures::{future::LocalBoxFuture, stream::LocalBoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ServerError, VariableDef, WsError};
use crate::{DataResponse, FilterQuery, Pagination};

/// A server-initiated read: the server names a variable and a reply channel,
/// and expects the client's current value back on that channel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VariableRequest {
    pub variable: VariableDef,
    #[serde(rename = "__rchan")]
    pub channel: String,
}

/// Out-of-band invalidation naming a variable whose cached state must be
/// discarded. `force` additionally asks the backend to bypass its own cache
/// on the recompute.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerTrigger {
    pub uid: String,
    #[serde(default = "default_true")]
    pub force: bool,
}

fn default_true() -> bool {
    true
}

/// Status of a long-running server-side computation, streamed over the
/// websocket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskUpdate {
    Progress { progress: f64 },
    Complete { result: Value },
    Failed { error: String },
    Cancelled,
}

/// The narrow observable/send contract of the websocket transport.
///
/// The core never sees reconnects or framing; implementations publish
/// inbound messages onto per-uid topics and expose them as streams here.
pub trait WsClient: 'static {
    /// Server-initiated variable reads, answered via [`Self::send_variable`].
    fn variable_requests(&self) -> LocalBoxStream<'static, VariableRequest>;

    /// Invalidation events scoped to one variable uid.
    fn server_triggers(&self, uid: &str) -> LocalBoxStream<'static, ServerTrigger>;

    /// Status stream of one long-running task.
    fn task_updates(&self, task_id: &str) -> LocalBoxStream<'static, TaskUpdate>;

    /// Replies to a [`VariableRequest`] on its reply channel.
    fn send_variable(
        &self,
        value: Value,
        channel: &str,
    ) -> LocalBoxFuture<'static, Result<(), WsError>>;
}

/// Request sent to the backend to compute a derived variable from the
/// resolved values of its inputs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DerivedRequest {
    pub uid: String,
    pub values: Vec<Value>,
    #[serde(default)]
    pub force: bool,
}

/// Backend answer to a [`DerivedRequest`]: either the value, or a task id
/// to follow on the websocket's task-status stream.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ComputeResponse {
    Value(Value),
    Task { task_id: String },
}

/// Request for one filtered, paginated slice of a data variable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DataRequest {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterQuery>,
    #[serde(default)]
    pub pagination: Pagination,
    /// Resolved input values, present only for derived data variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    #[serde(default)]
    pub force: bool,
}

/// The HTTP seam: executes derived-variable computations and serves data
/// slices. Implementations live outside the core.
pub trait Backend: 'static {
    fn compute(
        &self,
        request: DerivedRequest,
    ) -> LocalBoxFuture<'static, Result<ComputeResponse, ServerError>>;

    fn fetch_data(
        &self,
        request: DataRequest,
    ) -> LocalBoxFuture<'static, Result<DataResponse, ServerError>>;
}
