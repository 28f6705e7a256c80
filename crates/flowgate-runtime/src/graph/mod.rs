pub mod executor;
pub mod plan;
pub mod report;
pub mod routing;

pub use executor::{GraphEngine, RunOptions};
pub use plan::{validate, GraphPlan, ValidationReport};
pub use report::{NodeStatus, NodeTrace, RunReport};
pub use routing::EdgeState;
