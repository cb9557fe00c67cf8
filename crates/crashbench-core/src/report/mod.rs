pub mod console;
pub mod json;

pub use console::{print_latency_report, write_latency_report};
pub use json::{write_json_report, RunReport};
