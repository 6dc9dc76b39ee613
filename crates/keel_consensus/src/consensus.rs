//! Consensus module wiring.
//!
//! `retryable` contains the deduplication index and its coordinator,
//! `clock` the restart-safe coarse time source, `types` the shared
//! replicate/round contracts, and `settings`/`metrics` the runtime tuning
//! and gauge surface.

mod clock;
mod error;
mod metrics;
mod retryable;
mod settings;
mod types;

pub use clock::{
    CoarseTimePoint, ManualTimeSource, RestartSafeClock, SystemTimeSource, TimeSource,
};
pub use error::ConsensusError;
pub use metrics::RetryableRequestsMetrics;
pub use retryable::{IndexCounts, RetryableRequests};
pub use settings::{
    RetryableRequestSettings, DEFAULT_RANGE_TIME_LIMIT_SECS, DEFAULT_RETRYABLE_REQUEST_TIMEOUT_SECS,
};
pub use types::{
    ClientId, ConsensusRound, ConsensusRoundRef, OpId, ReplicateMsg, RequestId, RoundOutcome,
    WriteRequest,
};
