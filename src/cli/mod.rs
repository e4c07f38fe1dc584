pub mod cli_parameters;
pub mod cli_tools;

pub use cli_parameters::{CliParameterError, CliParameters};
pub use cli_tools::CliTools;
