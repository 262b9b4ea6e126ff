//! Pure domain logic: permissions, sessions, pairing state machines, and
//! pointer conditioning.  No I/O and no clocks; callers supply `now`.

pub mod cursor;
pub mod pairing;
pub mod permissions;
pub mod session;
