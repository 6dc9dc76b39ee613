use thiserror::Error;

use super::types::RequestId;

/// Failure surface of the retryable-request index.
///
/// The variants are cheap to clone because one replication failure fans out
/// to every deferred duplicate of the request.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// The request id is below the client's advertised low-watermark. The
    /// watermark is carried so the client can learn the minimum usable id.
    #[error("request id {request_id} is below min running request id {min_running_request_id}")]
    Expired {
        request_id: RequestId,
        min_running_request_id: RequestId,
    },

    /// The request id already sits inside a replicated range, or the request
    /// was a duplicate of an attempt that has since succeeded.
    #[error("{0}")]
    AlreadyPresent(String),

    /// Unknown client.
    #[error("{0}")]
    NotFound(String),

    /// Replication failed in the consensus layer.
    #[error("{0}")]
    Aborted(String),
}
