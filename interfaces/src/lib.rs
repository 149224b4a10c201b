//! Layer Interfaces Library
//!
//! This crate provides the service access points between the UE protocol
//! entities and the messages that cross them.

pub mod message_types;
pub mod sap;

pub use message_types::*;
pub use sap::{AsSapProvider, LowerLayer, UpperLayer};
