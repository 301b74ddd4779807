//! Network module.
//!
//! Contains the Gateway (TCP listener), the per-connection task, and
//! admission rate limiting.

mod connection;
mod gateway;
pub mod limit;

pub use connection::serve;
pub use gateway::Gateway;
pub use limit::AdmissionLimiter;
