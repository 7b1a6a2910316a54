//! Memory accounting for buffering operators.
//!
//! Pipeline breakers (hash join build side, aggregate groups, order-by and
//! select-k buffers) reserve what they hold through a [`MemoryReservation`].
//! There is no spilling: a reservation beyond the limit fails with
//! `ResourceExhausted` and the node reports it as a fatal error.

mod manager;

pub use manager::{MemoryManager, MemoryReservation, NoopMemoryManager, TrackingMemoryManager};
