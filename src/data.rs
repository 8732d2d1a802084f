use std::{
    cell::RefCell,
    collections::HashMap,
    ops::Range,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use futures::{stream::LocalBoxStream, task::noop_waker, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resolver::ResolverInner;
use crate::{
    combine_filters, Backend, DataRequest, FilterQuery, Pagination, ResolveError, Resolver,
    ServerTrigger, VariableInput,
};


/// Synthetic column stamped on every fetched row, used as a stable row key
/// for partial updates. Never sent back to the server and never exported.
pub const INDEX_COL: &str = "__index__";

pub type Row = serde_json::Map<String, Value>;

/// One slice of server-held tabular data as returned by the backend.
/// Rows arrive already stamped with [`INDEX_COL`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DataResponse {
    pub rows: Vec<Row>,
    #[serde(rename = "totalCount")]
    pub total_count: usize,
}

/// A fetched slice plus the table's total row count. Rows keep
/// [`INDEX_COL`] in memory; use [`DataFrame::records`] for any payload that
/// leaves the client.
#[derive(Clone, Debug, PartialEq)]
pub struct DataFrame {
    pub rows: Vec<Row>,
    pub total_count: usize,
}

impl DataFrame {
    /// Rows with the synthetic index column stripped, suitable for export
    /// or round-tripping to the user.
    pub fn records(&self) -> Vec<Row> {
        strip_index(self.rows.clone())
    }
}

/// Removes [`INDEX_COL`] from every row.
pub fn strip_index(mut rows: Vec<Row>) -> Vec<Row> {
    for row in &mut rows {
        row.remove(INDEX_COL);
    }
    rows
}

/// Decision for serving a contiguous row range against the currently loaded
/// window: reuse it, extend one end, or replace it outright.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WindowPlan {
    Skip,
    Prepend(Range<usize>),
    Append(Range<usize>),
    Replace(Range<usize>),
}

impl WindowPlan {
    /// Plans the minimal fetch for `requested` given the loaded window.
    /// Disjoint ranges, forced refreshes, and ranges extending past both
    /// ends fall back to a full replacement of exactly `requested`.
    pub fn plan(loaded: Option<&Range<usize>>, requested: &Range<usize>, force: bool) -> Self {
        let Some(loaded) = loaded.filter(|_| !force) else {
            return WindowPlan::Replace(requested.clone());
        };
        if requested.start >= loaded.start && requested.end <= loaded.end {
            return WindowPlan::Skip;
        }
        let disjoint = requested.end < loaded.start || requested.start > loaded.end;
        if disjoint || (requested.start < loaded.start && requested.end > loaded.end) {
            return WindowPlan::Replace(requested.clone());
        }
        if requested.start < loaded.start {
            WindowPlan::Prepend(requested.start..loaded.start)
        } else {
            WindowPlan::Append(loaded.end..requested.end)
        }
    }
}

struct Window {
    range: Range<usize>,
    rows: Vec<Row>,
}

#[derive(Default)]
struct DataState {
    window: Option<Window>,
    total_count: usize,
    // Set by a server trigger; consumed by the next fetch.
    stale: bool,
    edits: HashMap<u64, HashMap<String, Value>>,
}

/// Fetch handle for one data variable (plain or derived).
///
/// This is an explicit callback contract rather than a passive
/// subscription: callers invoke [`fetch`](DataHandle::fetch) or
/// [`fetch_window`](DataHandle::fetch_window) with filter/pagination
/// arguments, because the data volume makes eager resolution unsafe.
#[derive(Clone)]
pub struct DataHandle(Rc<DataNode>);

pub(crate) struct DataNode {
    uid: String,
    filters: Option<FilterQuery>,
    /// Inputs of a derived data variable; empty for a plain one.
    inputs: Vec<VariableInput>,
    resolver: Weak<ResolverInner>,
    backend: Rc<dyn Backend>,
    state: RefCell<DataState>,
    triggers: RefCell<LocalBoxStream<'static, ServerTrigger>>,
}

impl DataHandle {
    pub(crate) fn new(
        uid: String,
        filters: Option<FilterQuery>,
        inputs: Vec<VariableInput>,
        resolver: Weak<ResolverInner>,
        backend: Rc<dyn Backend>,
        triggers: LocalBoxStream<'static, ServerTrigger>,
    ) -> Self {
        DataHandle(Rc::new(DataNode {
            uid,
            filters,
            inputs,
            resolver,
            backend,
            state: RefCell::new(DataState::default()),
            triggers: RefCell::new(triggers),
        }))
    }

    pub fn uid(&self) -> &str {
        &self.0.uid
    }

    /// Fetches one slice, merging `filters` onto the descriptor's stored
    /// filter and passing `pagination` through verbatim.
    pub async fn fetch(
        &self,
        filters: Option<&FilterQuery>,
        pagination: Option<Pagination>,
    ) -> Result<DataFrame, ResolveError> {
        self.drain_triggers();
        let force = self.take_stale();
        let filters = combine_filters(self.0.filters.as_ref(), filters);
        let response = self
            .raw_fetch(filters, pagination.unwrap_or_default(), force)
            .await?;
        let mut state = self.0.state.borrow_mut();
        state.total_count = response.total_count;
        let rows = self.apply_edits(&state, response.rows);
        Ok(DataFrame {
            rows,
            total_count: response.total_count,
        })
    }

    /// Serves a contiguous row range for a virtualized view, fetching only
    /// the part of `range` not covered by the loaded window.
    ///
    /// Window fetches always use the descriptor's stored filter; changing
    /// filters invalidates row identity, so filtered reads go through
    /// [`fetch`](DataHandle::fetch).
    pub async fn fetch_window(
        &self,
        range: Range<usize>,
        force: bool,
    ) -> Result<DataFrame, ResolveError> {
        self.drain_triggers();
        let force = force || self.take_stale();
        let plan = {
            let state = self.0.state.borrow();
            WindowPlan::plan(state.window.as_ref().map(|w| &w.range), &range, force)
        };
        tracing::debug!(uid = %self.0.uid, ?range, ?plan, "window fetch");
        match plan.clone() {
            WindowPlan::Skip => {}
            WindowPlan::Prepend(missing) | WindowPlan::Append(missing) => {
                let response = self
                    .raw_fetch(
                        self.0.filters.clone(),
                        Pagination::range(missing.clone()),
                        force,
                    )
                    .await?;
                let mut state = self.0.state.borrow_mut();
                state.total_count = response.total_count;
                if let Some(window) = &mut state.window {
                    if matches!(plan, WindowPlan::Prepend(_)) {
                        if response.rows.len() < missing.len() {
                            // A short read on a prefix means the table shrank
                            // under us; the previously loaded rows are gone.
                            *window = Window {
                                range: missing.start..missing.start + response.rows.len(),
                                rows: response.rows,
                            };
                        } else {
                            window.range.start = missing.start;
                            let mut rows = response.rows;
                            rows.append(&mut window.rows);
                            window.rows = rows;
                        }
                    } else {
                        // The table may end inside the requested extension.
                        window.range.end = missing.start + response.rows.len();
                        window.rows.extend(response.rows);
                    }
                }
            }
            WindowPlan::Replace(target) => {
                let response = self
                    .raw_fetch(
                        self.0.filters.clone(),
                        Pagination::range(target.clone()),
                        force,
                    )
                    .await?;
                let mut state = self.0.state.borrow_mut();
                state.total_count = response.total_count;
                state.window = Some(Window {
                    range: target.start..target.start + response.rows.len(),
                    rows: response.rows,
                });
            }
        }

        let state = self.0.state.borrow();
        let Some(window) = &state.window else {
            return Ok(DataFrame {
                rows: Vec::new(),
                total_count: state.total_count,
            });
        };
        let start = range.start.clamp(window.range.start, window.range.end);
        let end = range.end.clamp(window.range.start, window.range.end);
        let rows = window.rows[start - window.range.start..end - window.range.start].to_vec();
        let rows = self.apply_edits(&state, rows);
        Ok(DataFrame {
            rows,
            total_count: state.total_count,
        })
    }

    /// Records a local cell edit keyed by the row's stable index. The
    /// overlay is applied to every subsequently returned slice until a
    /// server trigger invalidates it (server state wins after recompute).
    pub fn apply_edit(&self, index: u64, column: impl Into<String>, value: Value) {
        let mut state = self.0.state.borrow_mut();
        state
            .edits
            .entry(index)
            .or_default()
            .insert(column.into(), value);
    }

    async fn raw_fetch(
        &self,
        filters: Option<FilterQuery>,
        pagination: Pagination,
        force: bool,
    ) -> Result<DataResponse, ResolveError> {
        let values = self.resolve_inputs().await?;
        let request = DataRequest {
            uid: self.0.uid.clone(),
            filters,
            pagination,
            values,
            force,
        };
        Ok(self.0.backend.fetch_data(request).await?)
    }

    async fn resolve_inputs(&self) -> Result<Vec<Value>, ResolveError> {
        if self.0.inputs.is_empty() {
            return Ok(Vec::new());
        }
        let resolver = self
            .0
            .resolver
            .upgrade()
            .map(Resolver::from_inner)
            .ok_or_else(|| ResolveError::Config("resolver dropped".into()))?;
        let mut values = Vec::with_capacity(self.0.inputs.len());
        for input in &self.0.inputs {
            values.push(resolver.resolve(input).await?);
        }
        Ok(values)
    }

    fn apply_edits(&self, state: &DataState, mut rows: Vec<Row>) -> Vec<Row> {
        if state.edits.is_empty() {
            return rows;
        }
        for row in &mut rows {
            let Some(index) = row.get(INDEX_COL).and_then(Value::as_u64) else {
                continue;
            };
            if let Some(edit) = state.edits.get(&index) {
                for (column, value) in edit {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        rows
    }

    fn drain_triggers(&self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut triggers = self.0.triggers.borrow_mut();
        let mut state = self.0.state.borrow_mut();
        while let Poll::Ready(Some(trigger)) = triggers.poll_next_unpin(&mut cx) {
            tracing::debug!(uid = %self.0.uid, force = trigger.force, "server trigger; window invalidated");
            state.stale = true;
            state.window = None;
            state.edits.clear();
        }
    }

    // A trigger forces the next fetch to bypass the backend cache.
    fn take_stale(&self) -> bool {
        let mut state = self.0.state.borrow_mut();
        std::mem::take(&mut state.stale)
    }
}
