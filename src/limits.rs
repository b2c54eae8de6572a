//! Hard bounds on inputs and on table sizes.

pub const MAX_SLOT_CAPACITY: u32 = 10_000;
pub const MAX_SLOTS: usize = 1_000_000;
pub const MAX_ZONE_LEN: usize = 128;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_ADDRESS_LEN: usize = 1_024;
pub const MAX_NOTE_LEN: usize = 2_048;
pub const MAX_OPERATORS: usize = 256;
