//! Ring epoch/partition clock crate.
//!
//! This crate tracks which operations every partition of a hash ring has
//! applied as of each epoch, so a transaction batch can partially succeed
//! while any two participants that share an epoch can still prove they agree.
//! Higher layers supply an `OperationSink` and drive batches through
//! `RingState`.

pub mod ring;
