use std::collections::HashMap;

use chrono::Utc;
use ulid::Ulid;

use crate::model::*;

use super::{StoreError, Tables};

/// Handle passed to an atomic block.
///
/// Reads see the committed tables overlaid with this block's own staged rows. Writes are
/// checked against the schema constraints and staged as events; nothing reaches the
/// tables until the block commits. Dropping the handle discards everything staged.
pub struct Txn<'a> {
    id: Ulid,
    base: &'a Tables,
    slots: HashMap<SlotId, Slot>,
    bookings: HashMap<BookingId, Booking>,
    events: Vec<Event>,
    next_slot_id: SlotId,
    next_booking_id: BookingId,
}

impl<'a> Txn<'a> {
    pub(super) fn new(base: &'a Tables) -> Self {
        Self {
            id: Ulid::new(),
            base,
            slots: HashMap::new(),
            bookings: HashMap::new(),
            events: Vec::new(),
            next_slot_id: base.next_slot_id(),
            next_booking_id: base.next_booking_id(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id).or_else(|| self.base.slot(id))
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.get(&id).or_else(|| self.base.booking(id))
    }

    /// Slots visible to this block, committed and staged.
    pub fn slot_count(&self) -> usize {
        (self.next_slot_id - 1) as usize
    }

    /// Insert a slot with `booked_count = 0`, returning its generated id.
    pub fn insert_slot(&mut self, new: NewSlot) -> Result<SlotId, StoreError> {
        if new.capacity == 0 {
            return Err(StoreError::Integrity("slots.capacity must be positive".into()));
        }
        let id = self.next_slot_id;
        self.next_slot_id += 1;

        let slot = Slot {
            id,
            date: new.date,
            time_start: new.time_start,
            time_end: new.time_end,
            zone: new.zone,
            capacity: new.capacity,
            booked_count: 0,
        };
        self.events.push(Event::slot_created(&slot));
        self.slots.insert(id, slot);
        Ok(id)
    }

    /// Overwrite a slot's booked counter. Only the capacity ledger calls this.
    pub(crate) fn set_booked_count(&mut self, slot_id: SlotId, booked_count: u32) -> Result<(), StoreError> {
        let slot = self
            .staged_slot(slot_id)
            .ok_or_else(|| StoreError::Integrity(format!("slots row {slot_id} does not exist")))?;
        if booked_count > slot.capacity {
            return Err(StoreError::Integrity(format!(
                "slots.booked_count {booked_count} exceeds capacity {} for slot {slot_id}",
                slot.capacity
            )));
        }
        slot.booked_count = booked_count;
        self.events.push(Event::BookedCountChanged { slot_id, booked_count });
        Ok(())
    }

    /// Insert a `confirmed` booking, returning its generated id.
    pub fn insert_booking(&mut self, new: NewBooking) -> Result<BookingId, StoreError> {
        if self.slot(new.slot_id).is_none() {
            return Err(StoreError::Integrity(format!(
                "bookings.slot_id {} references no slot",
                new.slot_id
            )));
        }
        let id = self.next_booking_id;
        self.next_booking_id += 1;

        let booking = Booking {
            id,
            user_id: new.user_id,
            slot_id: new.slot_id,
            address: new.address,
            note: new.note,
            status: BookingStatus::Confirmed,
            created_at: Utc::now(),
        };
        self.events.push(Event::booking_created(&booking));
        self.bookings.insert(id, booking);
        Ok(id)
    }

    /// Move a booking to `status`. Setting the current status again is a no-op;
    /// a cancelled booking can never be confirmed again.
    pub fn set_booking_status(&mut self, id: BookingId, status: BookingStatus) -> Result<(), StoreError> {
        let booking = self
            .staged_booking(id)
            .ok_or_else(|| StoreError::Integrity(format!("bookings row {id} does not exist")))?;
        if booking.status == status {
            return Ok(());
        }
        match status {
            BookingStatus::Cancelled => {
                booking.status = BookingStatus::Cancelled;
                self.events.push(Event::BookingCancelled { id });
                Ok(())
            }
            BookingStatus::Confirmed => Err(StoreError::Integrity(format!(
                "booking {id} is cancelled and cannot change status"
            ))),
        }
    }

    pub(super) fn into_events(self) -> Vec<Event> {
        self.events
    }

    fn staged_slot(&mut self, id: SlotId) -> Option<&mut Slot> {
        if !self.slots.contains_key(&id) {
            let row = self.base.slot(id)?.clone();
            self.slots.insert(id, row);
        }
        self.slots.get_mut(&id)
    }

    fn staged_booking(&mut self, id: BookingId) -> Option<&mut Booking> {
        if !self.bookings.contains_key(&id) {
            let row = self.base.booking(id)?.clone();
            self.bookings.insert(id, row);
        }
        self.bookings.get_mut(&id)
    }
}
