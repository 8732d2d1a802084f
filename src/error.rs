use thiserror::Error;

/// Failures of condition evaluation.
///
/// Both variants indicate misconfiguration (a bad operator name or operands
/// of types that cannot be ordered), not a runtime condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("unsupported condition operator `{0}`")]
    UnsupportedOperator(String),
    #[error("operands of type {left} and {right} cannot be ordered")]
    Incomparable {
        left: &'static str,
        right: &'static str,
    },
}

/// Failures of variable descriptor decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("unknown variable __typename `{0}`")]
    UnknownTypename(String),
    #[error("malformed variable descriptor: {0}")]
    Malformed(String),
}

/// Failures reported by the backend that computes derived variables and
/// serves data slices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded with status {status}: {message}")]
    Server { status: u16, message: String },
}

/// Failures of the websocket collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    #[error("websocket connection closed")]
    Closed,
    #[error("websocket send failed: {0}")]
    Send(String),
}

/// Failures surfaced to callers of variable resolution.
///
/// Cloneable so a single failed computation can be delivered to every caller
/// awaiting the same deduplicated request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("task was cancelled")]
    TaskCancelled,
}

impl From<ConditionError> for ResolveError {
    fn from(e: ConditionError) -> Self {
        ResolveError::Config(e.to_string())
    }
}

impl From<DescriptorError> for ResolveError {
    fn from(e: DescriptorError) -> Self {
        ResolveError::Config(e.to_string())
    }
}
