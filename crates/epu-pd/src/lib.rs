//! Reference process dispatcher served on the EPU message bus.

pub mod constraints;
pub mod service;

pub use constraints::match_constraints;
pub use service::{ProcessDispatcher, ProcessRecord};
