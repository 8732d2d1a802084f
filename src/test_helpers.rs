use std::{cell::RefCell, collections::HashMap, collections::VecDeque, rc::Rc};

use futures::{channel::oneshot, future::LocalBoxFuture, FutureExt, StreamExt};
use serde_json::{json, Value};

use crate::{
    Backend, ComputeResponse, DataRequest, DataResponse, DerivedRequest, DerivedVariable,
    Resolver, Row, Scope, ServerError, ServerTrigger, StateSynchronizer, TaskUpdate, Topic,
    Variable, VariableDef, VariableInput, VariableRequest, WsClient, WsError, INDEX_COL,
};

pub fn var(uid: &str) -> Variable {
    Variable {
        uid: uid.to_string(),
        default: None,
        scope: Scope::Session,
    }
}

pub fn var_with_default(uid: &str, default: Value) -> Variable {
    Variable {
        default: Some(default),
        ..var(uid)
    }
}

pub fn input_var_with_default(uid: &str, default: Value) -> VariableInput {
    VariableInput::Def(Box::new(VariableDef::Variable(var_with_default(
        uid, default,
    ))))
}

pub fn derived(uid: &str, variables: Vec<VariableInput>) -> DerivedVariable {
    DerivedVariable {
        uid: uid.to_string(),
        variables,
        deps: None,
    }
}

pub fn setup() -> (StateSynchronizer, StubWsClient, StubBackend, Resolver) {
    let sync = StateSynchronizer::new();
    let ws = StubWsClient::new();
    let backend = StubBackend::new();
    let resolver = Resolver::new(sync.clone(), Rc::new(ws.clone()), Rc::new(backend.clone()));
    (sync, ws, backend, resolver)
}

/// Scriptable [`Backend`]. Unless scripted, `compute` echoes the request's
/// values back as an array and `fetch_data` slices a fixture table.
#[derive(Clone, Default)]
pub struct StubBackend(Rc<RefCell<StubBackendState>>);

#[derive(Default)]
struct StubBackendState {
    compute_calls: Vec<DerivedRequest>,
    data_calls: Vec<DataRequest>,
    scripted: VecDeque<Result<ComputeResponse, ServerError>>,
    manual: bool,
    waiters: VecDeque<oneshot::Sender<Result<ComputeResponse, ServerError>>>,
    table: Vec<Row>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `compute` futures stay pending until
    /// [`StubBackend::respond`] is called, for overlap tests.
    pub fn manual() -> Self {
        let backend = Self::default();
        backend.0.borrow_mut().manual = true;
        backend
    }

    /// A backend serving a table of `len` rows shaped
    /// `{"__index__": i, "v": i * 10}`.
    pub fn with_table(len: usize) -> Self {
        let backend = Self::default();
        backend.0.borrow_mut().table = (0..len)
            .map(|i| {
                let mut row = Row::new();
                row.insert(INDEX_COL.to_string(), json!(i));
                row.insert("v".to_string(), json!(i * 10));
                row
            })
            .collect();
        backend
    }

    /// Shrinks the fixture table, as if rows were deleted server-side.
    pub fn truncate_table(&self, len: usize) {
        self.0.borrow_mut().table.truncate(len);
    }

    pub fn push_response(&self, response: Result<ComputeResponse, ServerError>) {
        self.0.borrow_mut().scripted.push_back(response);
    }

    /// Completes the oldest pending manual `compute` call.
    pub fn respond(&self, response: Result<ComputeResponse, ServerError>) {
        let waiter = self
            .0
            .borrow_mut()
            .waiters
            .pop_front()
            .expect("no pending compute call");
        let _ = waiter.send(response);
    }

    pub fn compute_calls(&self) -> Vec<DerivedRequest> {
        self.0.borrow().compute_calls.clone()
    }

    pub fn data_calls(&self) -> Vec<DataRequest> {
        self.0.borrow().data_calls.clone()
    }
}

impl Backend for StubBackend {
    fn compute(
        &self,
        request: DerivedRequest,
    ) -> LocalBoxFuture<'static, Result<ComputeResponse, ServerError>> {
        let mut state = self.0.borrow_mut();
        state.compute_calls.push(request.clone());
        if state.manual {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            async move {
                rx.await
                    .unwrap_or_else(|_| Err(ServerError::Network("stub dropped".into())))
            }
            .boxed_local()
        } else {
            let response = state
                .scripted
                .pop_front()
                .unwrap_or_else(|| Ok(ComputeResponse::Value(Value::Array(request.values))));
            async move { response }.boxed_local()
        }
    }

    fn fetch_data(
        &self,
        request: DataRequest,
    ) -> LocalBoxFuture<'static, Result<DataResponse, ServerError>> {
        let mut state = self.0.borrow_mut();
        state.data_calls.push(request.clone());
        let offset = request.pagination.offset.unwrap_or(0);
        let limit = request.pagination.limit.unwrap_or(state.table.len());
        let rows: Vec<Row> = state
            .table
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let total_count = state.table.len();
        async move { Ok(DataResponse { rows, total_count }) }.boxed_local()
    }
}

/// In-memory [`WsClient`] built on [`Topic`]s, with push helpers standing in
/// for server-sent messages and a record of every reply sent.
#[derive(Clone, Default)]
pub struct StubWsClient(Rc<StubWsState>);

#[derive(Default)]
struct StubWsState {
    requests: Topic<VariableRequest>,
    triggers: RefCell<HashMap<String, Topic<ServerTrigger>>>,
    tasks: RefCell<HashMap<String, Topic<TaskUpdate>>>,
    sent: RefCell<Vec<(Value, String)>>,
}

impl StubWsClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_request(&self, variable: VariableDef, channel: &str) {
        self.0.requests.publish(VariableRequest {
            variable,
            channel: channel.to_string(),
        });
    }

    pub fn push_trigger(&self, uid: &str) {
        self.trigger_topic(uid).publish(ServerTrigger {
            uid: uid.to_string(),
            force: true,
        });
    }

    pub fn push_task_update(&self, task_id: &str, update: TaskUpdate) {
        self.task_topic(task_id).publish(update);
    }

    pub fn sent(&self) -> Vec<(Value, String)> {
        self.0.sent.borrow().clone()
    }

    fn trigger_topic(&self, uid: &str) -> Topic<ServerTrigger> {
        self.0
            .triggers
            .borrow_mut()
            .entry(uid.to_string())
            .or_default()
            .clone()
    }

    fn task_topic(&self, task_id: &str) -> Topic<TaskUpdate> {
        self.0
            .tasks
            .borrow_mut()
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }
}

impl WsClient for StubWsClient {
    fn variable_requests(&self) -> futures::stream::LocalBoxStream<'static, VariableRequest> {
        self.0.requests.subscribe().boxed_local()
    }

    fn server_triggers(&self, uid: &str) -> futures::stream::LocalBoxStream<'static, ServerTrigger> {
        self.trigger_topic(uid).subscribe().boxed_local()
    }

    fn task_updates(&self, task_id: &str) -> futures::stream::LocalBoxStream<'static, TaskUpdate> {
        self.task_topic(task_id).subscribe().boxed_local()
    }

    fn send_variable(
        &self,
        value: Value,
        channel: &str,
    ) -> LocalBoxFuture<'static, Result<(), WsError>> {
        self.0.sent.borrow_mut().push((value, channel.to_string()));
        async { Ok(()) }.boxed_local()
    }
}
