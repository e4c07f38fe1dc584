/// Apicase - a data-driven API test engine with case dependencies, layered variables and assertions
pub mod assertions;
pub mod auth;
pub mod cli;
pub mod constants;
pub mod database;
pub mod error;
pub mod executor;
pub mod expression;
pub mod extract;
pub mod functions;
pub mod logger;
pub mod models;
pub mod placeholders;
pub mod relations;
pub mod request;
pub mod session;
pub mod settings;
pub mod transport;
pub mod variables;

pub use error::{ApiTestError, Result};
pub use session::Session;
