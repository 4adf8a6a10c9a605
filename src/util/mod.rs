//! Utility modules: resilient calls and timeouts.

pub mod retry;
pub mod timeout;

pub use retry::ResilientCallExecutor;
pub use timeout::with_timeout;
