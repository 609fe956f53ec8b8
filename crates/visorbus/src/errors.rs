use crate::attachment::ClientState;
use crate::controlvm::message::MessageError;
use crate::controlvm::payload::PayloadError;
use crate::header::ValidationError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Channel validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Signal queue is full")]
    QueueFull,

    #[error("Signal size mismatch: queue holds {actual}-byte slots, caller uses {expected}")]
    SignalSizeMismatch { expected: u32, actual: u32 },

    #[error("Invalid signal queue at offset {offset:#x}: {reason}")]
    InvalidQueue { offset: usize, reason: &'static str },

    #[error("Corrupt {cursor} cursor {value} (max_slots {max_slots})")]
    CorruptCursor {
        cursor: &'static str,
        value: u32,
        max_slots: u32,
    },

    #[error("Access of {len} bytes at offset {offset:#x} exceeds region of {region_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    #[error("Misaligned atomic access at offset {0:#x}")]
    Misaligned(usize),

    #[error("Channel server is not ready")]
    ServerNotReady,

    #[error("Client is not attached (state {0:?})")]
    NotAttached(ClientState),

    #[error("Unknown state value {value} in {field}")]
    UnknownState { field: &'static str, value: u32 },

    #[error("Illegal client state transition {from:?} -> {to:?}")]
    IllegalTransition { from: ClientState, to: ClientState },

    #[error("Client state changed underneath us: wrote {wrote:?}, read back {read:?}")]
    TransitionLost { wrote: ClientState, read: ClientState },

    #[error("Malformed message: {0}")]
    Message(#[from] MessageError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Crash message slot {0} out of range")]
    CrashSlotOutOfRange(usize),

    #[error("Semaphore error: {0}")]
    SemaphoreError(String),
}

impl ChannelError {
    /// Capacity errors are backpressure: the caller retries or defers.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ChannelError::QueueFull)
    }
}
