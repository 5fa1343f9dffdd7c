//! Stratum error type.

use thiserror::Error;

/// Anything returned from [`super::ProtocolSession::dispatch_incoming`] is a
/// protocol violation; the pool connection closes and reconnects later.
#[derive(Error, Debug)]
pub enum StratumError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected message: {0}")]
    InvalidMessage(String),

    #[error("reply to unknown request {0}")]
    UnknownReplyId(u64),

    /// A worker was refused under the fatal-session policy
    #[error("worker {0} refused by pool")]
    AuthorizationFailed(String),

    #[error("job {0} has been replaced")]
    StaleJob(String),

    #[error("no worker left to submit under")]
    NoWorker,

    #[error("bad pool url: {0}")]
    InvalidUrl(String),
}

pub type StratumResult<T> = Result<T, StratumError>;
