use std::{cell::RefCell, collections::HashMap, rc::Rc};

use futures::{future::LocalBoxFuture, FutureExt, StreamExt};
use serde_json::Value;

use crate::{
    condition, Backend, DataHandle, DerivedClient, DerivedVariable, Loadable, ResolveError,
    Scope, StateSynchronizer, Subscription, Variable, VariableDef, VariableInput, VariableUpdate,
    WsClient,
};


/// Resolves variable descriptors to values.
///
/// Plain variables live in a local store seeded from their defaults and
/// kept coherent through the [`StateSynchronizer`]; derived variables
/// delegate to a per-uid [`DerivedClient`]; data variables hand out an
/// explicit [`DataHandle`] instead of a value.
///
/// Cheap to clone; one instance per session (or per tab when constructed
/// with [`Resolver::with_tab`]).
#[derive(Clone)]
pub struct Resolver(Rc<ResolverInner>);

pub(crate) struct ResolverInner {
    sync: StateSynchronizer,
    ws: Rc<dyn WsClient>,
    backend: Rc<dyn Backend>,
    tab_id: Option<String>,
    store: RefCell<HashMap<String, Value>>,
    derived: RefCell<HashMap<String, DerivedClient>>,
    data: RefCell<HashMap<String, DataHandle>>,
    // Store-coherence subscriptions, one per touched plain key, held for
    // the resolver's lifetime.
    subscriptions: RefCell<Vec<Subscription>>,
}

impl Resolver {
    pub fn new(sync: StateSynchronizer, ws: Rc<dyn WsClient>, backend: Rc<dyn Backend>) -> Self {
        Self::build(sync, ws, backend, None)
    }

    /// A resolver whose tab-scoped variables are namespaced under `tab_id`,
    /// so two tabs sharing one synchronizer do not share tab-local state.
    pub fn with_tab(
        tab_id: impl Into<String>,
        sync: StateSynchronizer,
        ws: Rc<dyn WsClient>,
        backend: Rc<dyn Backend>,
    ) -> Self {
        Self::build(sync, ws, backend, Some(tab_id.into()))
    }

    fn build(
        sync: StateSynchronizer,
        ws: Rc<dyn WsClient>,
        backend: Rc<dyn Backend>,
        tab_id: Option<String>,
    ) -> Self {
        Resolver(Rc::new(ResolverInner {
            sync,
            ws,
            backend,
            tab_id,
            store: RefCell::new(HashMap::new()),
            derived: RefCell::new(HashMap::new()),
            data: RefCell::new(HashMap::new()),
            subscriptions: RefCell::new(Vec::new()),
        }))
    }

    pub(crate) fn from_inner(inner: Rc<ResolverInner>) -> Self {
        Resolver(inner)
    }

    pub fn synchronizer(&self) -> &StateSynchronizer {
        &self.0.sync
    }

    /// The synchronizer key a plain variable's state is reconciled under.
    pub fn sync_key(&self, var: &Variable) -> String {
        match (var.scope, &self.0.tab_id) {
            (Scope::Tab, Some(tab)) => format!("tab:{tab}:{}", var.uid),
            _ => var.uid.clone(),
        }
    }

    /// Resolves any input to a value, recursing through nested descriptors
    /// and conditions. This is the suspending variant: derived inputs may
    /// await a server round-trip.
    pub fn resolve<'a>(
        &'a self,
        input: &'a VariableInput,
    ) -> LocalBoxFuture<'a, Result<Value, ResolveError>> {
        async move {
            match input {
                VariableInput::Literal(value) => Ok(value.clone()),
                VariableInput::Condition(cond) => {
                    let value = self.resolve(&cond.variable).await?;
                    let other = self.resolve(&cond.other).await?;
                    Ok(Value::Bool(condition::evaluate(
                        &cond.operator,
                        &value,
                        &other,
                    )?))
                }
                VariableInput::Def(def) => self.resolve_def(def).await,
            }
        }
        .boxed_local()
    }

    pub fn resolve_def<'a>(
        &'a self,
        def: &'a VariableDef,
    ) -> LocalBoxFuture<'a, Result<Value, ResolveError>> {
        async move {
            match def {
                VariableDef::Variable(var) => Ok(self.plain_value(var)),
                VariableDef::DerivedVariable(derived) => {
                    self.derived_client(derived).resolve(self, false).await
                }
                // Data variables never resolve to their rows (the volume
                // makes eager resolution unsafe); as a dependency value
                // they contribute their descriptor, which the server
                // resolves on its side. Rows go through `data_handle`.
                VariableDef::DataVariable(_) | VariableDef::DerivedDataVariable(_) => {
                    serde_json::to_value(def).map_err(|e| ResolveError::Config(e.to_string()))
                }
            }
        }
        .boxed_local()
    }

    /// Non-suspending read used by the websocket responder and by UI code
    /// that renders stale state instead of suspending.
    pub fn get(&self, def: &VariableDef) -> Loadable<Value> {
        match def {
            VariableDef::Variable(var) => Loadable::Resolved(self.plain_value(var)),
            VariableDef::DerivedVariable(derived) => self.derived_client(derived).latest(),
            VariableDef::DataVariable(_) | VariableDef::DerivedDataVariable(_) => {
                Loadable::Pending
            }
        }
    }

    /// Current value of a plain variable, seeding the store and the
    /// synchronizer key from the declared default on first touch.
    pub fn plain_value(&self, var: &Variable) -> Value {
        let key = self.ensure_plain(var);
        self.0
            .store
            .borrow()
            .get(&key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Writes a plain variable and broadcasts the update to every other
    /// subscriber of its key.
    pub fn set(&self, var: &Variable, value: Value) {
        let key = self.ensure_plain(var);
        let old = self.write_store(&key, value.clone());
        self.0.sync.notify(&key, VariableUpdate::update(value, old));
    }

    /// Restores a plain variable to its declared default.
    pub fn reset(&self, var: &Variable) {
        let key = self.ensure_plain(var);
        let default = var.default.clone().unwrap_or(Value::Null);
        let old = self.write_store(&key, default.clone());
        self.0.sync.notify(&key, VariableUpdate::reset(default, old));
    }

    /// Forces recomputation of a derived variable, bypassing the
    /// fingerprint cache. Retrying after a failure is the caller's call;
    /// the core never retries on its own.
    pub async fn refresh(&self, derived: &DerivedVariable) -> Result<Value, ResolveError> {
        self.derived_client(derived).resolve(self, true).await
    }

    /// The per-uid task client for a derived variable, created on first use.
    pub fn derived_client(&self, derived: &DerivedVariable) -> DerivedClient {
        self.0
            .derived
            .borrow_mut()
            .entry(derived.uid.clone())
            .or_insert_with(|| {
                DerivedClient::new(
                    derived.clone(),
                    self.0.sync.clone(),
                    self.0.backend.clone(),
                    self.0.ws.clone(),
                )
            })
            .clone()
    }

    /// The fetch handle for a data variable. Fails on non-data descriptors:
    /// that is a wiring bug, not a runtime condition.
    ///
    /// Handles and their window state are local to this resolver, so keys
    /// need no tab namespacing: per-tab resolvers already give tab-scoped
    /// data variables isolated windows. The declared scope travels in the
    /// serialized descriptor for the server's benefit.
    pub fn data_handle(&self, def: &VariableDef) -> Result<DataHandle, ResolveError> {
        let (uid, filters, inputs) = match def {
            VariableDef::DataVariable(d) => (d.uid.clone(), d.filters.clone(), Vec::new()),
            VariableDef::DerivedDataVariable(d) => {
                (d.uid.clone(), d.filters.clone(), d.variables.clone())
            }
            other => {
                return Err(ResolveError::Config(format!(
                    "`{}` is not a data variable",
                    other.uid()
                )))
            }
        };
        Ok(self
            .0
            .data
            .borrow_mut()
            .entry(uid.clone())
            .or_insert_with(|| {
                DataHandle::new(
                    uid.clone(),
                    filters,
                    inputs,
                    Rc::downgrade(&self.0),
                    self.0.backend.clone(),
                    self.0.ws.server_triggers(&uid),
                )
            })
            .clone())
    }

    /// Serves server-initiated variable reads for the lifetime of the
    /// websocket stream. Resolution failures are answered with null and
    /// logged; they never wedge the stream.
    pub async fn run_variable_request_responder(&self) {
        let mut requests = self.0.ws.variable_requests();
        while let Some(request) = requests.next().await {
            let value = match self.respond(&request.variable).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(uid = request.variable.uid(), error = %e, "variable request failed");
                    Value::Null
                }
            };
            if let Err(e) = self.0.ws.send_variable(value, &request.channel).await {
                tracing::warn!(channel = %request.channel, error = %e, "variable reply failed");
            }
        }
    }

    async fn respond(&self, def: &VariableDef) -> Result<Value, ResolveError> {
        match def {
            VariableDef::Variable(var) => Ok(self.plain_value(var)),
            VariableDef::DerivedVariable(derived) => {
                let client = self.derived_client(derived);
                match client.latest() {
                    Loadable::Resolved(value) => Ok(value),
                    _ => client.resolve(self, false).await,
                }
            }
            VariableDef::DataVariable(_) | VariableDef::DerivedDataVariable(_) => Ok(Value::Null),
        }
    }

    fn ensure_plain(&self, var: &Variable) -> String {
        let key = self.sync_key(var);
        if !self.0.store.borrow().contains_key(&key) {
            let default = var.default.clone().unwrap_or(Value::Null);
            self.0
                .store
                .borrow_mut()
                .insert(key.clone(), default.clone());
            self.0.sync.register(&key, default);
            let weak = Rc::downgrade(&self.0);
            let store_key = key.clone();
            let sub = self.0.sync.subscribe(&key, move |update| {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .store
                        .borrow_mut()
                        .insert(store_key.clone(), update.value().clone());
                }
            });
            self.0.subscriptions.borrow_mut().push(sub);
        }
        key
    }

    fn write_store(&self, key: &str, value: Value) -> Value {
        self.0
            .store
            .borrow_mut()
            .insert(key.to_string(), value)
            .unwrap_or(Value::Null)
    }
}
