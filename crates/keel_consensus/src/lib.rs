//! Consensus-layer subsystem of the Keel distributed SQL database.
//!
//! This crate owns the retryable-request deduplication index. The write hot
//! path consults it under the consensus replica's update lock to admit or
//! reject every incoming replicate and to park duplicates of requests still
//! in flight. The log GC loop polls it for the minimum op id the log must
//! still retain. Higher layers supply replicate messages and consensus
//! rounds; see [`consensus::RetryableRequests`].

pub mod consensus;
