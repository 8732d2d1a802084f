mod condition;
mod data;
mod derived;
mod descriptor;
mod error;
mod loadable;
mod query;
mod resolver;
mod subscription;
mod synchronizer;
mod topic;
mod ws;

pub use condition::*;
pub use data::*;
pub use derived::*;
pub use descriptor::*;
pub use error::*;
pub use loadable::*;
pub use query::*;
pub use resolver::*;
pub use subscription::*;
pub use synchronizer::*;
pub use topic::*;
pub use ws::*;

#[cfg(test)]
mod test_helpers;
