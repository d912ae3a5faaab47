use crate::types::{RequestId, UserId};
use sled::transaction::TransactionError;

/// Every failure the engine reports to its caller.
///
/// The calling boundary maps these onto user-visible responses; none of them
/// leave a partially applied transition behind.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("request {0} was not found")]
    RequestNotFound(RequestId),
    #[error("{approver} is not a member of the approval chain for {request}")]
    MemberNotFound { request: RequestId, approver: UserId },
    #[error("{actor} is not the active approver for {request}")]
    NotAuthorized { request: RequestId, actor: UserId },
    #[error("{actor} may not act on {request}: only the pending recommender or the active approver can")]
    Forbidden { request: RequestId, actor: UserId },
    #[error("approval chain conflict: {0}")]
    Conflict(String),
    #[error("session token was not recognised")]
    Unauthenticated,
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error("failed to mint identifier: {0}")]
    Identifier(String),
    #[error("stored value could not be (de)serialised: {0}")]
    Codec(String),
    #[error("store failure: {0}")]
    Store(#[from] sled::Error),
}

impl ChainError {
    /// True for both missing requests and missing chain members.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChainError::RequestNotFound(_) | ChainError::MemberNotFound { .. }
        )
    }
}

impl From<TransactionError<ChainError>> for ChainError {
    fn from(value: TransactionError<ChainError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => ChainError::Store(e),
        }
    }
}
