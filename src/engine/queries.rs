use chrono::NaiveDate;

use crate::model::*;

use super::Engine;

// Listings read committed state outside any atomic block. Counts in them are advisory:
// a booking attempt re-checks capacity inside its own block.
impl Engine {
    pub async fn list_slots(&self, filter: SlotFilter) -> Vec<Slot> {
        self.store.read(|t| t.slots_matching(&filter)).await
    }

    /// Slots with at least one free unit, optionally restricted to one day.
    pub async fn list_bookable_slots(&self, day: Option<NaiveDate>) -> Vec<Slot> {
        self.list_slots(SlotFilter::bookable(day)).await
    }

    /// Every slot on `date`, full ones included, by start time.
    pub async fn list_slots_for_day(&self, date: NaiveDate) -> Vec<Slot> {
        self.list_slots(SlotFilter::on(date)).await
    }

    pub async fn list_bookable_days(&self) -> Vec<NaiveDate> {
        self.store.read(|t| t.bookable_days()).await
    }

    pub async fn get_slot(&self, id: SlotId) -> Option<Slot> {
        self.store.read(|t| t.slot(id).cloned()).await
    }

    pub async fn get_booking(&self, id: BookingId) -> Option<Booking> {
        self.store.read(|t| t.booking(id).cloned()).await
    }

    pub async fn list_bookings_for_slot(&self, slot_id: SlotId) -> Vec<Booking> {
        self.store.read(|t| t.bookings_for_slot(slot_id)).await
    }
}
