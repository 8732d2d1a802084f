use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::Value;


/// Row-matching operator of a [`FilterQuery::Value`] leaf. Passed verbatim to
/// the data endpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    Bt,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    And,
    Or,
}

/// A structured predicate tree over table columns.
///
/// The tree is built client-side and interpreted server-side; this crate
/// only composes and transports it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum FilterQuery {
    Clause {
        combinator: Combinator,
        clauses: Vec<FilterQuery>,
    },
    Value {
        column: String,
        operator: QueryOperator,
        value: Value,
    },
}

impl FilterQuery {
    pub fn value(column: impl Into<String>, operator: QueryOperator, value: Value) -> Self {
        FilterQuery::Value {
            column: column.into(),
            operator,
            value,
        }
    }
    pub fn all(clauses: Vec<FilterQuery>) -> Self {
        FilterQuery::Clause {
            combinator: Combinator::And,
            clauses,
        }
    }
    pub fn any(clauses: Vec<FilterQuery>) -> Self {
        FilterQuery::Clause {
            combinator: Combinator::Or,
            clauses,
        }
    }
}

/// ANDs a caller-supplied filter onto a descriptor's stored filter.
pub fn combine_filters(
    base: Option<&FilterQuery>,
    other: Option<&FilterQuery>,
) -> Option<FilterQuery> {
    match (base, other) {
        (Some(base), Some(other)) => Some(FilterQuery::all(vec![base.clone(), other.clone()])),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Sort {
    pub column: String,
    #[serde(default)]
    pub desc: bool,
}

/// Slice selection for a data fetch: `{offset, limit, sort?}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Pagination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
}

impl Pagination {
    /// Pagination covering exactly the given contiguous row range.
    pub fn range(range: Range<usize>) -> Self {
        Pagination {
            offset: Some(range.start),
            limit: Some(range.len()),
            sort: None,
        }
    }
}
