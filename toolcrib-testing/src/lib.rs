//! Test support for toolcrib store adapters.
//!
//! - [`chaos`] wraps any [`toolcrib::ReservationStore`] and injects failures:
//!   unavailable sequence counters, dropped connections, deadlocks at commit.
//! - [`contract`] holds the scenarios every adapter must pass, and the
//!   [`reservation_store_contract_tests!`] macro that turns them into tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaos;
pub mod contract;

pub use chaos::*;
