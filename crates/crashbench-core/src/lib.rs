pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod killer;
pub mod model;
pub mod oracle;
pub mod processor;
pub mod report;
pub mod sources;
pub mod stats;
pub mod status;

pub use errors::{BenchError, VerifyError};
