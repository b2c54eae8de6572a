use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Storage-generated slot identifier. Starts at 1.
pub type SlotId = i64;

/// Storage-generated booking identifier. Starts at 1.
pub type BookingId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookable time window with a fixed number of capacity units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub date: NaiveDate,
    pub time_start: NaiveTime,
    pub time_end: NaiveTime,
    pub zone: Option<String>,
    pub capacity: u32,
    /// Confirmed bookings against this slot. Only the ledger writes it.
    pub booked_count: u32,
}

impl Slot {
    /// Units still free. Advisory when read outside an atomic block.
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_count)
    }

    pub fn is_bookable(&self) -> bool {
        self.booked_count < self.capacity
    }
}

/// One user's claim on one unit of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: String,
    pub slot_id: SlotId,
    pub address: Option<String>,
    pub note: Option<String>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSlot {
    pub date: NaiveDate,
    pub time_start: NaiveTime,
    pub time_end: NaiveTime,
    pub capacity: u32,
    pub zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: String,
    pub slot_id: SlotId,
    pub address: Option<String>,
    pub note: Option<String>,
}

impl NewBooking {
    pub fn new(user_id: impl Into<String>, slot_id: SlotId) -> Self {
        Self {
            user_id: user_id.into(),
            slot_id,
            address: None,
            note: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Selection for slot listings. The default selects every slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub date: Option<NaiveDate>,
    pub bookable_only: bool,
}

impl SlotFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn on(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            bookable_only: false,
        }
    }

    pub fn bookable(date: Option<NaiveDate>) -> Self {
        Self {
            date,
            bookable_only: true,
        }
    }

    pub fn matches(&self, slot: &Slot) -> bool {
        self.date.is_none_or(|d| d == slot.date) && (!self.bookable_only || slot.is_bookable())
    }
}

/// Flat event types, no nesting. Committed atomic blocks are logged as lists of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: SlotId,
        date: NaiveDate,
        time_start: NaiveTime,
        time_end: NaiveTime,
        zone: Option<String>,
        capacity: u32,
        booked_count: u32,
    },
    BookedCountChanged {
        slot_id: SlotId,
        booked_count: u32,
    },
    BookingCreated {
        id: BookingId,
        user_id: String,
        slot_id: SlotId,
        address: Option<String>,
        note: Option<String>,
        status: BookingStatus,
        created_at: DateTime<Utc>,
    },
    BookingCancelled {
        id: BookingId,
    },
}

impl Event {
    pub fn slot_created(slot: &Slot) -> Self {
        Event::SlotCreated {
            id: slot.id,
            date: slot.date,
            time_start: slot.time_start,
            time_end: slot.time_end,
            zone: slot.zone.clone(),
            capacity: slot.capacity,
            booked_count: slot.booked_count,
        }
    }

    pub fn booking_created(booking: &Booking) -> Self {
        Event::BookingCreated {
            id: booking.id,
            user_id: booking.user_id.clone(),
            slot_id: booking.slot_id,
            address: booking.address.clone(),
            note: booking.note.clone(),
            status: booking.status,
            created_at: booking.created_at,
        }
    }
}

/// One committed atomic block. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub txn: Ulid,
    pub events: Vec<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(capacity: u32, booked_count: u32) -> Slot {
        Slot {
            id: 1,
            date: NaiveDate::from_ymd_opt(2025, 9, 21).unwrap(),
            time_start: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            time_end: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            zone: None,
            capacity,
            booked_count,
        }
    }

    #[test]
    fn remaining_and_bookable() {
        assert_eq!(slot(3, 1).remaining(), 2);
        assert!(slot(3, 2).is_bookable());
        assert!(!slot(3, 3).is_bookable());
        assert_eq!(slot(3, 3).remaining(), 0);
    }

    #[test]
    fn filter_matches_date_and_capacity() {
        let s = slot(1, 1);
        assert!(SlotFilter::all().matches(&s));
        assert!(SlotFilter::on(s.date).matches(&s));
        assert!(!SlotFilter::on(s.date.succ_opt().unwrap()).matches(&s));
        assert!(!SlotFilter::bookable(None).matches(&s)); // full
        assert!(SlotFilter::bookable(Some(s.date)).matches(&slot(2, 1)));
    }

    #[test]
    fn status_parse() {
        assert_eq!(BookingStatus::parse("Cancelled"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::parse("canceled"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::parse("confirmed"), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::parse("pending"), None);
        assert_eq!(BookingStatus::Confirmed.to_string(), "confirmed");
    }

    #[test]
    fn wal_record_serialization_roundtrip() {
        let record = WalRecord {
            txn: Ulid::new(),
            events: vec![
                Event::slot_created(&slot(2, 0)),
                Event::BookingCreated {
                    id: 1,
                    user_id: "42".into(),
                    slot_id: 1,
                    address: Some("Khreshchatyk 1".into()),
                    note: None,
                    status: BookingStatus::Confirmed,
                    created_at: Utc::now(),
                },
                Event::BookedCountChanged { slot_id: 1, booked_count: 1 },
            ],
        };
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: WalRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
