//! Fixed-Capacity Ring Buffer
//!
//! Provides the bounded, overwrite-oldest ring used for the acceleration
//! window and the pre-trigger video frame ring.
//!
//! The buffer itself is not synchronized: each owner guards it with the
//! single lock of the entity it belongs to.

mod buffer;

pub use buffer::RingBuffer;
