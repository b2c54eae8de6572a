use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;

use crate::model::*;

use super::StoreError;

/// Committed rows plus the two lookup indexes (slots by date, bookings by slot).
///
/// Rows are never deleted, so the next generated id is always `last key + 1`.
#[derive(Debug, Default)]
pub struct Tables {
    slots: BTreeMap<SlotId, Slot>,
    bookings: BTreeMap<BookingId, Booking>,
    slots_by_date: BTreeMap<NaiveDate, BTreeSet<SlotId>>,
    bookings_by_slot: HashMap<SlotId, Vec<BookingId>>,
}

impl Tables {
    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.get(&id)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub(super) fn next_slot_id(&self) -> SlotId {
        self.slots.last_key_value().map_or(1, |(id, _)| id + 1)
    }

    pub(super) fn next_booking_id(&self) -> BookingId {
        self.bookings.last_key_value().map_or(1, |(id, _)| id + 1)
    }

    /// Slots passing `filter`, ordered by date, then start time, then id.
    pub fn slots_matching(&self, filter: &SlotFilter) -> Vec<Slot> {
        let days: Vec<&BTreeSet<SlotId>> = match filter.date {
            Some(date) => self.slots_by_date.get(&date).into_iter().collect(),
            None => self.slots_by_date.values().collect(),
        };

        let mut out = Vec::new();
        for ids in days {
            let mut day: Vec<&Slot> = ids
                .iter()
                .filter_map(|id| self.slots.get(id))
                .filter(|s| filter.matches(s))
                .collect();
            day.sort_by_key(|s| (s.time_start, s.id));
            out.extend(day.into_iter().cloned());
        }
        out
    }

    /// Dates with at least one slot that still has a free unit, ascending.
    pub fn bookable_days(&self) -> Vec<NaiveDate> {
        self.slots_by_date
            .iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| self.slots.get(id))
                    .any(Slot::is_bookable)
            })
            .map(|(date, _)| *date)
            .collect()
    }

    /// Bookings referencing `slot_id`, in id order.
    pub fn bookings_for_slot(&self, slot_id: SlotId) -> Vec<Booking> {
        self.bookings_by_slot
            .get(&slot_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.bookings.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Scan-based check of every schema invariant. Runs after replay, never on the hot path.
    pub fn verify(&self) -> Result<(), StoreError> {
        for slot in self.slots.values() {
            if slot.capacity == 0 {
                return Err(StoreError::Integrity(format!("slot {} has zero capacity", slot.id)));
            }
            if slot.booked_count > slot.capacity {
                return Err(StoreError::Integrity(format!(
                    "slot {} booked_count {} exceeds capacity {}",
                    slot.id, slot.booked_count, slot.capacity
                )));
            }
            let confirmed = self
                .bookings_by_slot
                .get(&slot.id)
                .map_or(0, |ids| {
                    ids.iter()
                        .filter_map(|id| self.bookings.get(id))
                        .filter(|b| b.is_confirmed())
                        .count()
                });
            if confirmed != slot.booked_count as usize {
                return Err(StoreError::Integrity(format!(
                    "slot {} booked_count {} but {confirmed} confirmed bookings",
                    slot.id, slot.booked_count
                )));
            }
        }
        if let Some(orphan) = self.bookings.values().find(|b| !self.slots.contains_key(&b.slot_id)) {
            return Err(StoreError::Integrity(format!(
                "booking {} references missing slot {}",
                orphan.id, orphan.slot_id
            )));
        }
        Ok(())
    }

    /// Apply a committed event. Events were validated before they were logged.
    pub(super) fn apply(&mut self, event: &Event) {
        match event {
            Event::SlotCreated {
                id,
                date,
                time_start,
                time_end,
                zone,
                capacity,
                booked_count,
            } => {
                self.slots.insert(
                    *id,
                    Slot {
                        id: *id,
                        date: *date,
                        time_start: *time_start,
                        time_end: *time_end,
                        zone: zone.clone(),
                        capacity: *capacity,
                        booked_count: *booked_count,
                    },
                );
                self.slots_by_date.entry(*date).or_default().insert(*id);
            }
            Event::BookedCountChanged { slot_id, booked_count } => {
                if let Some(slot) = self.slots.get_mut(slot_id) {
                    slot.booked_count = *booked_count;
                }
            }
            Event::BookingCreated {
                id,
                user_id,
                slot_id,
                address,
                note,
                status,
                created_at,
            } => {
                self.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        user_id: user_id.clone(),
                        slot_id: *slot_id,
                        address: address.clone(),
                        note: note.clone(),
                        status: *status,
                        created_at: *created_at,
                    },
                );
                self.bookings_by_slot.entry(*slot_id).or_default().push(*id);
            }
            Event::BookingCancelled { id } => {
                if let Some(booking) = self.bookings.get_mut(id) {
                    booking.status = BookingStatus::Cancelled;
                }
            }
        }
    }

    /// Events that recreate the current state: every slot, then every booking.
    pub(super) fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.slots.len() + self.bookings.len());
        events.extend(self.slots.values().map(Event::slot_created));
        events.extend(self.bookings.values().map(Event::booking_created));
        events
    }
}
