//! Hash-linked record of every transition a request went through
use super::error::ChainError;
use super::request::RequestStatus;
use super::types::{RequestId, TimeStamp, UserId};
use super::utils::digest_cbor;
use chrono::Utc;
use std::fmt;

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum HistoryAction {
    #[n(0)]
    Created {
        #[n(0)]
        approvers: u32,
    },
    #[n(1)]
    RecommenderApproved,
    #[n(2)]
    RecommenderRejected {
        #[n(0)]
        comment: Option<String>,
    },
    #[n(3)]
    Approved {
        #[n(0)]
        position: u32,
    },
    #[n(4)]
    Rejected {
        #[n(0)]
        position: u32,
        #[n(1)]
        comment: Option<String>,
    },
    #[n(5)]
    Inserted {
        #[n(0)]
        approver: UserId,
        #[n(1)]
        position: u32,
    },
    #[n(6)]
    Removed {
        #[n(0)]
        approver: UserId,
        #[n(1)]
        position: u32,
    },
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryAction::Created { approvers } => write!(f, "created with {approvers} approvers"),
            HistoryAction::RecommenderApproved => f.write_str("recommender approved"),
            HistoryAction::RecommenderRejected { .. } => f.write_str("recommender rejected"),
            HistoryAction::Approved { position } => write!(f, "approved at position {position}"),
            HistoryAction::Rejected { position, .. } => write!(f, "rejected at position {position}"),
            HistoryAction::Inserted { approver, position } => {
                write!(f, "inserted {approver} at position {position}")
            }
            HistoryAction::Removed { approver, position } => {
                write!(f, "removed {approver} from position {position}")
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct HistoryEntry {
    #[n(0)]
    pub actor: Option<UserId>, // None for chain edits made on behalf of the request
    #[n(1)]
    pub timestamp: TimeStamp<Utc>,
    #[n(2)]
    pub action: HistoryAction,
    #[n(3)]
    pub status: RequestStatus, // request status after the action
    #[n(4)]
    pub prev_hash: Option<String>, // sha256 of the previous entry's cbor
}

impl HistoryEntry {
    pub fn build(&self) -> Result<(String, Vec<u8>), ChainError> {
        digest_cbor(self)
    }
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct History {
    #[n(0)]
    pub request_id: RequestId,
    #[n(1)]
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            entries: vec![],
        }
    }
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head_hash(&self) -> Result<Option<String>, ChainError> {
        self.entries
            .last()
            .map(|entry| entry.build().map(|(hash, _)| hash))
            .transpose()
    }

    /// Appends an entry linked to the current head and returns its hash.
    pub fn append(
        &mut self,
        actor: Option<UserId>,
        action: HistoryAction,
        status: RequestStatus,
        timestamp: TimeStamp<Utc>,
    ) -> Result<String, ChainError> {
        let entry = HistoryEntry {
            actor,
            timestamp,
            action,
            status,
            prev_hash: self.head_hash()?,
        };
        let (hash, _) = entry.build()?;
        self.entries.push(entry);
        Ok(hash)
    }

    /// Walks the entries and checks every link against the recomputed hash.
    pub fn verify(&self) -> Result<(), ChainError> {
        let mut expected: Option<String> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.prev_hash != expected {
                return Err(ChainError::Conflict(format!(
                    "history of {} is broken at entry {index}",
                    self.request_id
                )));
            }
            expected = Some(entry.build()?.0);
        }
        Ok(())
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "history of {}", self.request_id)?;
        for entry in &self.entries {
            let actor = entry.actor.as_ref().map_or("-", |a| a.as_str());
            writeln!(
                f,
                "  {} {actor}: {} -> {}",
                entry.timestamp, entry.action, entry.status
            )?;
        }
        Ok(())
    }
}
