//! Protocol Stack Layers Library
//!
//! This crate implements the UE side of a dual-connectivity protocol stack:
//! the PDCP receive reordering engine and the NAS attachment state machine.

pub mod nas;
pub mod pdcp;

use common::sim::TimerService;
use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayerError {
    #[error("Layer not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cannot have more than {0} EPS bearers")]
    TooManyBearers(u8),

    #[error("Not implemented: {0}")]
    Unsupported(String),

    #[error("No lower layer attached for {0}")]
    NoLowerLayer(String),

    #[error("Connection to cell {cell} failed after {attempts} attempts")]
    RetriesExhausted { cell: u16, attempts: u32 },
}

/// Lifecycle shared by the protocol entities of one UE
pub trait ProtocolLayer {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Validate configuration and become ready to process traffic
    fn initialize(&mut self) -> Result<(), LayerError>;

    /// Tear down: release pending timers and buffered state
    fn shutdown(&mut self, timers: &mut dyn TimerService) -> Result<(), LayerError>;
}
