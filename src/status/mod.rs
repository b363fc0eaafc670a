pub mod types;
pub mod source;
pub mod log_monitor;
