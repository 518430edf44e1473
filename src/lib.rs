pub mod config;
pub mod errors;
pub mod flow;
pub mod stages_file;
pub mod telemetry;
