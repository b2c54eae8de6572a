//! The capacity ledger: the only code that moves a slot's `booked_count`.
//!
//! Both steps take the caller's [`Txn`], so the counter check and the counter write land in
//! the same atomic block as whatever booking row change they accompany.

use tracing::warn;

use crate::model::SlotId;
use crate::observability;
use crate::store::Txn;

use super::EngineError;

/// Claim one unit of `slot_id`. Fails with `SlotFull` and writes nothing when none is left.
pub fn reserve_unit(txn: &mut Txn<'_>, slot_id: SlotId) -> Result<(), EngineError> {
    let slot = txn.slot(slot_id).ok_or(EngineError::SlotNotFound(slot_id))?;
    if slot.booked_count >= slot.capacity {
        return Err(EngineError::SlotFull {
            slot_id,
            capacity: slot.capacity,
        });
    }
    let next = slot.booked_count + 1;
    txn.set_booked_count(slot_id, next)?;
    Ok(())
}

/// Return one unit of `slot_id`. A release at zero leaves the counter alone.
pub fn release_unit(txn: &mut Txn<'_>, slot_id: SlotId) -> Result<(), EngineError> {
    let slot = txn.slot(slot_id).ok_or(EngineError::SlotNotFound(slot_id))?;
    if slot.booked_count == 0 {
        warn!("ledger underflow: release on slot {slot_id} with booked_count 0 (txn {})", txn.id());
        metrics::counter!(observability::LEDGER_UNDERFLOW_TOTAL).increment(1);
        return Ok(());
    }
    let next = slot.booked_count - 1;
    txn.set_booked_count(slot_id, next)?;
    Ok(())
}
