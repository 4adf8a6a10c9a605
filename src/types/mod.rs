//! Core types for convoy.

pub mod generation;
pub mod message;
pub mod session;
pub mod stream;
pub mod usage;

pub use generation::*;
pub use message::*;
pub use session::*;
pub use stream::*;
pub use usage::*;
