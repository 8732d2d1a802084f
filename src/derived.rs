use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    task::{Context, Poll},
};

use futures::{
    future::{LocalBoxFuture, Shared},
    stream::LocalBoxStream,
    task::noop_waker,
    FutureExt, StreamExt,
};
use serde_json::Value;

use crate::{
    ComputeResponse, DerivedRequest, DerivedVariable, Loadable, ResolveError, Resolver,
    StateSynchronizer, TaskUpdate, VariableUpdate, WsClient,
};

#[cfg(test)]
mod tests;

type SharedResult = Shared<LocalBoxFuture<'static, Result<Value, ResolveError>>>;

/// Deterministic digest of a computation's inputs: the canonical JSON
/// serialization of the function identity and the value list. Structural
/// and order-sensitive.
pub fn fingerprint<'a>(uid: &str, values: impl IntoIterator<Item = &'a Value>) -> String {
    let values: Vec<&Value> = values.into_iter().collect();
    serde_json::to_string(&(uid, values)).expect("JSON values always serialize")
}

#[derive(Default)]
struct DerivedState {
    /// Trigger fingerprint and value of the last successful computation.
    cached: Option<(String, Value)>,
    last_error: Option<ResolveError>,
    /// In-flight requests keyed by request fingerprint; concurrent callers
    /// await the same shared future.
    pending: HashMap<String, SharedResult>,
    /// Set by a server trigger: the next resolution recomputes even if the
    /// trigger fingerprint is unchanged.
    invalidated: bool,
    force_backend: bool,
    /// Bumped per received trigger, so a completing request knows whether a
    /// trigger arrived after it was issued.
    trigger_epoch: u64,
}

/// Computes and caches the value of one derived variable, minimizing
/// redundant server round-trips.
///
/// Recomputation happens iff the fingerprint of the allowlisted
/// dependencies changes or a server trigger names this variable; identical
/// concurrent requests share a single backend call. Failures reject every
/// awaiting caller and are never retried here.
#[derive(Clone)]
pub struct DerivedClient(Rc<DerivedNode>);

struct DerivedNode {
    def: DerivedVariable,
    sync: StateSynchronizer,
    backend: Rc<dyn crate::Backend>,
    ws: Rc<dyn WsClient>,
    state: RefCell<DerivedState>,
    triggers: RefCell<LocalBoxStream<'static, crate::ServerTrigger>>,
}

impl DerivedClient {
    pub(crate) fn new(
        def: DerivedVariable,
        sync: StateSynchronizer,
        backend: Rc<dyn crate::Backend>,
        ws: Rc<dyn WsClient>,
    ) -> Self {
        sync.register(&def.uid, Value::Null);
        let triggers = RefCell::new(ws.server_triggers(&def.uid));
        DerivedClient(Rc::new(DerivedNode {
            def,
            sync,
            backend,
            ws,
            state: RefCell::new(DerivedState::default()),
            triggers,
        }))
    }

    pub fn uid(&self) -> &str {
        &self.0.def.uid
    }

    /// The latest known computation state without touching the server.
    pub fn latest(&self) -> Loadable<Value> {
        let state = self.0.state.borrow();
        if let Some((_, value)) = &state.cached {
            Loadable::Resolved(value.clone())
        } else if let Some(err) = &state.last_error {
            Loadable::Failed(err.clone())
        } else {
            Loadable::Pending
        }
    }

    /// Resolves the current value, recomputing only when needed.
    pub async fn resolve(&self, resolver: &Resolver, force: bool) -> Result<Value, ResolveError> {
        self.drain_triggers();

        let mut values = Vec::with_capacity(self.0.def.variables.len());
        for input in &self.0.def.variables {
            values.push(resolver.resolve(input).await?);
        }
        let trigger_fp = fingerprint(&self.0.def.uid, self.allowlisted(&values));

        let (invalidated, force_backend) = {
            let state = self.0.state.borrow();
            (state.invalidated, state.force_backend)
        };
        let recompute = force || invalidated;
        if !recompute {
            if let Some((cached_fp, value)) = &self.0.state.borrow().cached {
                if *cached_fp == trigger_fp {
                    tracing::debug!(uid = %self.0.def.uid, "dependency fingerprint unchanged; serving cache");
                    return Ok(value.clone());
                }
            }
        }

        let request_fp = fingerprint(&self.0.def.uid, &values);
        let shared = {
            let mut state = self.0.state.borrow_mut();
            if let Some(shared) = state.pending.get(&request_fp) {
                tracing::debug!(uid = %self.0.def.uid, "joining in-flight request");
                shared.clone()
            } else {
                let epoch = state.trigger_epoch;
                let fut = self
                    .0
                    .clone()
                    .run(
                        values,
                        request_fp.clone(),
                        trigger_fp,
                        force || force_backend,
                        epoch,
                    )
                    .boxed_local()
                    .shared();
                state.pending.insert(request_fp.clone(), fut.clone());
                fut
            }
        };
        shared.await
    }

    /// Values participating in the recompute fingerprint: the `deps`
    /// allowlist when declared (inputs without a uid always participate),
    /// every input otherwise.
    fn allowlisted<'a>(&self, values: &'a [Value]) -> Vec<&'a Value> {
        match &self.0.def.deps {
            None => values.iter().collect(),
            Some(deps) => self
                .0
                .def
                .variables
                .iter()
                .zip(values)
                .filter(|(input, _)| {
                    input
                        .uid()
                        .map_or(true, |uid| deps.iter().any(|d| d == uid))
                })
                .map(|(_, value)| value)
                .collect(),
        }
    }

    fn drain_triggers(&self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut triggers = self.0.triggers.borrow_mut();
        let mut state = self.0.state.borrow_mut();
        while let Poll::Ready(Some(trigger)) = triggers.poll_next_unpin(&mut cx) {
            tracing::debug!(uid = %self.0.def.uid, force = trigger.force, "server trigger; cache invalidated");
            state.invalidated = true;
            state.force_backend |= trigger.force;
            state.trigger_epoch += 1;
        }
    }
}

impl DerivedNode {
    async fn run(
        self: Rc<Self>,
        values: Vec<Value>,
        request_fp: String,
        trigger_fp: String,
        force: bool,
        epoch: u64,
    ) -> Result<Value, ResolveError> {
        let request = DerivedRequest {
            uid: self.def.uid.clone(),
            values,
            force,
        };
        let result = match self.backend.compute(request).await {
            Ok(ComputeResponse::Value(value)) => Ok(value),
            Ok(ComputeResponse::Task { task_id }) => self.await_task(&task_id).await,
            Err(e) => Err(e.into()),
        };

        let mut state = self.state.borrow_mut();
        state.pending.remove(&request_fp);
        match result {
            Ok(value) => {
                let old = state
                    .cached
                    .take()
                    .map(|(_, v)| v)
                    .unwrap_or(Value::Null);
                state.cached = Some((trigger_fp, value.clone()));
                state.last_error = None;
                // A trigger that raced this request outlives it: the flags
                // stay set so the next access recomputes.
                if state.trigger_epoch == epoch {
                    state.invalidated = false;
                    state.force_backend = false;
                }
                drop(state);
                self.sync
                    .notify(&self.def.uid, VariableUpdate::update(value.clone(), old));
                Ok(value)
            }
            Err(e) => {
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Follows a long-running computation on the websocket's task-status
    /// stream; the eventual result funnels through the same resolution path
    /// as an immediate response.
    async fn await_task(&self, task_id: &str) -> Result<Value, ResolveError> {
        let mut updates = self.ws.task_updates(task_id);
        while let Some(update) = updates.next().await {
            match update {
                TaskUpdate::Progress { progress } => {
                    tracing::debug!(uid = %self.def.uid, task_id, progress, "task progress");
                }
                TaskUpdate::Complete { result } => return Ok(result),
                TaskUpdate::Failed { error } => return Err(ResolveError::TaskFailed(error)),
                TaskUpdate::Cancelled => return Err(ResolveError::TaskCancelled),
            }
        }
        Err(crate::WsError::Closed.into())
    }
}
