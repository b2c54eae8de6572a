use thiserror::Error;

use crate::model::{BookingId, SlotId};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("slot not found: {0}")]
    SlotNotFound(SlotId),

    #[error("booking not found: {0}")]
    BookingNotFound(BookingId),

    #[error("slot {slot_id} is full: all {capacity} units booked")]
    SlotFull { slot_id: SlotId, capacity: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),
}

impl EngineError {
    /// The operation was not applied and may succeed if repeated as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::IoFailure(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(msg) => EngineError::IoFailure(msg),
            StoreError::Integrity(msg) => EngineError::IntegrityViolation(msg),
        }
    }
}
