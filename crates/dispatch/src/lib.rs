//! Dispatch Worker Pool (C6): leases ready queue rows and
//! drives them through the ESP adapter with layered rate limiting,
//! retry/backoff, and terminal suppression.
pub mod backoff;
pub mod worker;

pub use worker::{DispatchWorker, Disposition};
