use crate::ResolveError;

/// Tri-state view of an asynchronous resolution: nothing yet, a resolved
/// value, or a failure. The resolver never folds a failure back into a
/// default value; callers render error states explicitly.
#[derive(Clone, Debug, PartialEq)]
pub enum Loadable<T> {
    Pending,
    Resolved(T),
    Failed(ResolveError),
}

impl<T> Loadable<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Loadable::Pending)
    }

    pub fn ok(&self) -> Option<&T> {
        match self {
            Loadable::Resolved(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Loadable<&T> {
        match self {
            Loadable::Pending => Loadable::Pending,
            Loadable::Resolved(v) => Loadable::Resolved(v),
            Loadable::Failed(e) => Loadable::Failed(e.clone()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Loadable<U> {
        match self {
            Loadable::Pending => Loadable::Pending,
            Loadable::Resolved(v) => Loadable::Resolved(f(v)),
            Loadable::Failed(e) => Loadable::Failed(e),
        }
    }
}

impl<T> From<Result<T, ResolveError>> for Loadable<T> {
    fn from(r: Result<T, ResolveError>) -> Self {
        match r {
            Ok(v) => Loadable::Resolved(v),
            Err(e) => Loadable::Failed(e),
        }
    }
}
