//! Dev-server process supervision

mod supervisor;

pub use supervisor::{ProcessSupervisor, StartedProcess, DEFAULT_STOP_GRACE};
