//! Dependency-ordered cooperative execution: every component registers a
//! Delegate, the Registrar resolves priority order once at startup, and a
//! single core thread repeatedly calls `Execute()` then blocks on the
//! Sentinel until new work arrives.

pub mod delegate;
pub mod registrar;
pub mod sentinel;
pub mod task_service;

pub use delegate::{Delegate, identifier_for};
pub use registrar::{Registrar, SchedulerError};
pub use sentinel::Sentinel;
pub use task_service::TaskService;
