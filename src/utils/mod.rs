//! Internal helpers shared across the crate.

pub(crate) mod io;

pub(crate) use io::GuestIO;
