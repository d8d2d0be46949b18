//! Scheduling module - turns N keywords and M proxies into per-worker work
//!
//! Everything here is decided once, before dispatch, and never rebalanced.

pub mod partitioner;
pub mod proxy_assigner;

pub use partitioner::partition;
pub use proxy_assigner::{AssignmentError, ProxyAssignment, ProxyPool};
