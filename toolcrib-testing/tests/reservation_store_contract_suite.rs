//! Runs the reservation store contract against the in-memory adapter.
//!
//! Any adapter plugs into the same scenarios through the
//! `reservation_store_contract_tests!` macro; new scenarios reach every
//! invocation automatically.

use toolcrib_testing::reservation_store_contract_tests;

reservation_store_contract_tests! {
    suite = in_memory,
    make_store = toolcrib_memory::InMemoryReservationStore::new,
}
