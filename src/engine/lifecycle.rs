use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{ledger, Engine, EngineError};

/// Outcome of a cancel request that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellation {
    /// The booking moved to `cancelled` and its unit went back to the slot.
    Cancelled(Booking),
    /// The booking was cancelled before; nothing changed.
    AlreadyCancelled,
}

fn normalize_text(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn validate_slot(new: &mut NewSlot) -> Result<(), EngineError> {
    if new.capacity == 0 {
        return Err(EngineError::InvalidInput("capacity must be positive"));
    }
    if new.capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::InvalidInput("capacity too large"));
    }
    if new.time_end <= new.time_start {
        return Err(EngineError::InvalidInput("time_end must be after time_start"));
    }
    new.zone = normalize_text(new.zone.take()).filter(|z| z != "-");
    if new.zone.as_ref().is_some_and(|z| z.len() > MAX_ZONE_LEN) {
        return Err(EngineError::InvalidInput("zone too long"));
    }
    Ok(())
}

fn validate_booking(new: &mut NewBooking) -> Result<(), EngineError> {
    new.user_id = new.user_id.trim().to_string();
    if new.user_id.is_empty() {
        return Err(EngineError::InvalidInput("user_id must not be empty"));
    }
    if new.user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::InvalidInput("user_id too long"));
    }
    new.address = normalize_text(new.address.take());
    if new.address.as_ref().is_some_and(|a| a.len() > MAX_ADDRESS_LEN) {
        return Err(EngineError::InvalidInput("address too long"));
    }
    new.note = normalize_text(new.note.take());
    if new.note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::InvalidInput("note too long"));
    }
    Ok(())
}

fn rejection_reason(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotFull { .. } => "slot_full",
        EngineError::SlotNotFound(_) => "slot_not_found",
        EngineError::InvalidInput(_) => "invalid_input",
        EngineError::IoFailure(_) => "io_failure",
        _ => "other",
    }
}

impl Engine {
    pub async fn create_slot(&self, mut new: NewSlot) -> Result<SlotId, EngineError> {
        validate_slot(&mut new)?;
        let (date, start) = (new.date, new.time_start);
        let id = self
            .store
            .atomic(|txn| {
                if txn.slot_count() >= MAX_SLOTS {
                    return Err(EngineError::InvalidInput("too many slots"));
                }
                Ok(txn.insert_slot(new)?)
            })
            .await?;
        info!("slot {id} created for {date} {start}");
        Ok(id)
    }

    /// Reserve a unit of the slot and record the booking, in one block.
    pub async fn create_booking(&self, mut new: NewBooking) -> Result<Booking, EngineError> {
        let result = match validate_booking(&mut new) {
            Ok(()) => {
                self.store
                    .atomic(|txn| {
                        ledger::reserve_unit(txn, new.slot_id)?;
                        let id = txn.insert_booking(new)?;
                        txn.booking(id)
                            .cloned()
                            .ok_or(EngineError::BookingNotFound(id))
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(booking) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                debug!("booking {} confirmed on slot {}", booking.id, booking.slot_id);
            }
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => rejection_reason(e))
                    .increment(1);
            }
        }
        result
    }

    /// Cancel a booking and release its unit, in one block. Cancelling twice is a no-op.
    pub async fn cancel_booking(&self, id: BookingId) -> Result<Cancellation, EngineError> {
        let outcome = self
            .store
            .atomic(|txn| -> Result<Cancellation, EngineError> {
                let booking = txn.booking(id).ok_or(EngineError::BookingNotFound(id))?;
                if !booking.is_confirmed() {
                    return Ok(Cancellation::AlreadyCancelled);
                }
                let slot_id = booking.slot_id;
                txn.set_booking_status(id, BookingStatus::Cancelled)?;
                ledger::release_unit(txn, slot_id)?;
                let cancelled = txn.booking(id).cloned().ok_or(EngineError::BookingNotFound(id))?;
                Ok(Cancellation::Cancelled(cancelled))
            })
            .await?;

        if let Cancellation::Cancelled(booking) = &outcome {
            metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
            debug!("booking {} cancelled on slot {}", booking.id, booking.slot_id);
        }
        Ok(outcome)
    }
}
