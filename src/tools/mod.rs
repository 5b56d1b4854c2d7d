pub mod executor;
pub mod schema;

pub use executor::{ExecutionReport, ToolExecutor};
pub use schema::validate_args;
