//! Shared types for the consensus layer.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the deduplication index and the replication/log layers.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::error::ConsensusError;

/// Client-assigned write request identifier. Monotonically issued per
/// client; retries of the same write reuse the id.
pub type RequestId = u64;

/// 128-bit client identifier, carried on the wire as two 64-bit halves.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClientId {
    pub hi: u64,
    pub lo: u64,
}

impl ClientId {
    pub const NIL: ClientId = ClientId { hi: 0, lo: 0 };

    pub const fn from_parts(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// Log coordinate of a consensus entry, totally ordered by `(term, index)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

impl OpId {
    /// Identity element when computing a minimum over op ids.
    pub const MAX: OpId = OpId {
        term: i64::MAX,
        index: i64::MAX,
    };

    pub const fn new(term: i64, index: i64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// The fields of a write payload read by the deduplication index.
///
/// `min_running_request_id` is the client's low-watermark: the client
/// promises to never issue a request id below it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub client_id: ClientId,
    pub request_id: RequestId,
    pub min_running_request_id: RequestId,
}

/// A log entry offered for replication. Entries without a write payload
/// (config changes, no-ops) are not retryable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateMsg {
    pub id: OpId,
    pub write: Option<WriteRequest>,
}

impl ReplicateMsg {
    pub fn write_op(
        id: OpId,
        client_id: ClientId,
        request_id: RequestId,
        min_running_request_id: RequestId,
    ) -> Self {
        Self {
            id,
            write: Some(WriteRequest {
                client_id,
                request_id,
                min_running_request_id,
            }),
        }
    }

    pub fn no_op(id: OpId) -> Self {
        Self { id, write: None }
    }

    pub fn has_write(&self) -> bool {
        self.write.is_some()
    }
}

/// Outcome delivered to a consensus round once its replication resolves.
///
/// `applied_op_ids` is `None` when the round was resolved on behalf of
/// another attempt (a deferred duplicate).
#[derive(Debug)]
pub struct RoundOutcome {
    pub status: Result<(), ConsensusError>,
    pub leader_term: i64,
    pub applied_op_ids: Option<Vec<OpId>>,
}

/// Shared handle to a consensus round.
pub type ConsensusRoundRef = Arc<ConsensusRound>;

/// A replicate entry in flight through consensus, with a one-shot sink
/// through which the round learns its outcome.
#[derive(Debug)]
pub struct ConsensusRound {
    replicate: ReplicateMsg,
    outcome_tx: Mutex<Option<oneshot::Sender<RoundOutcome>>>,
}

impl ConsensusRound {
    /// Round paired with a receiver for its outcome.
    pub fn new(replicate: ReplicateMsg) -> (ConsensusRoundRef, oneshot::Receiver<RoundOutcome>) {
        let (tx, rx) = oneshot::channel();
        let round = Arc::new(Self {
            replicate,
            outcome_tx: Mutex::new(Some(tx)),
        });
        (round, rx)
    }

    /// Round with no listener; notifications are dropped.
    pub fn detached(replicate: ReplicateMsg) -> ConsensusRoundRef {
        Arc::new(Self {
            replicate,
            outcome_tx: Mutex::new(None),
        })
    }

    pub fn replicate_msg(&self) -> &ReplicateMsg {
        &self.replicate
    }

    /// Deliver the replication outcome. One-shot: the first call wins and
    /// every later call is a no-op.
    pub fn notify_replication_finished(
        &self,
        status: Result<(), ConsensusError>,
        leader_term: i64,
        applied_op_ids: Option<Vec<OpId>>,
    ) {
        let Ok(mut slot) = self.outcome_tx.lock() else {
            return;
        };
        if let Some(tx) = slot.take() {
            let _ = tx.send(RoundOutcome {
                status,
                leader_term,
                applied_op_ids,
            });
        }
    }
}
