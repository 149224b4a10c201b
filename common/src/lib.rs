//! Common Utilities and Types Library
//!
//! This crate provides shared identifiers, utilities and the discrete-event
//! scheduler used across the multi-connectivity UE implementation.

pub mod sim;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use sim::*;
pub use types::*;
pub use utils::*;
