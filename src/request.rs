//! The note for approval and the draft it is built from
use super::error::ChainError;
use super::types::{RequestId, TimeStamp, UserId};
use chrono::Utc;
use std::collections::HashSet;
use std::fmt;

/// Coarse status of a request, derived from its chain by the projector.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Waiting on the recommender.
    #[n(0)]
    Pending,
    /// The chain is progressing.
    #[n(1)]
    Initiated,
    #[n(2)]
    Completed,
    /// Rejected by the recommender.
    #[n(3)]
    Rejected,
    #[n(4)]
    RejectedByApprover,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            RequestStatus::Pending | RequestStatus::Initiated => false,
            RequestStatus::Completed
            | RequestStatus::Rejected
            | RequestStatus::RejectedByApprover => true,
        }
    }
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Initiated => "Initiated",
            RequestStatus::Completed => "Completed",
            RequestStatus::Rejected => "Rejected",
            RequestStatus::RejectedByApprover => "Rejected_By_Approver",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    #[n(0)]
    Low,
    #[n(1)]
    #[default]
    Normal,
    #[n(2)]
    High,
    #[n(3)]
    Urgent,
}

// metadata carried along with the request, never read by the chain logic
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDetails {
    #[n(0)]
    pub subject: String,
    #[n(1)]
    pub description: String,
    #[n(2)]
    pub reference: String,
    #[n(3)]
    pub priority: Priority,
    #[n(4)]
    pub project_id: Option<u64>,
    #[n(5)]
    pub tower_id: Option<u64>,
    #[n(6)]
    pub area_id: Option<u64>,
    #[n(7)]
    pub department_id: Option<u64>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    #[n(0)]
    pub id: RequestId,
    #[n(1)]
    pub initiator: UserId,
    #[n(2)]
    pub recommender: UserId,
    #[n(3)]
    pub last_recommender: Option<UserId>,
    #[n(4)]
    pub status: RequestStatus,
    #[n(5)]
    pub comment: Option<String>, // set when the recommender rejects
    #[n(6)]
    pub details: RequestDetails,
    #[n(7)]
    pub created: TimeStamp<Utc>,
}

/// Builder for a new request; becomes a [`Request`] on [`RequestDraft::validate_and_finalise`].
#[derive(Debug, Default, Clone)]
pub struct RequestDraft {
    recommender: Option<UserId>,
    last_recommender: Option<UserId>,
    details: RequestDetails,
    approvers: Vec<UserId>,
}

impl RequestDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_recommender(mut self, recommender: UserId) -> Self {
        self.recommender = Some(recommender);
        self
    }
    pub fn set_last_recommender(mut self, last_recommender: UserId) -> Self {
        self.last_recommender = Some(last_recommender);
        self
    }
    pub fn set_subject(mut self, subject: impl Into<String>) -> Self {
        self.details.subject = subject.into();
        self
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.details.description = description.into();
        self
    }
    pub fn set_reference(mut self, reference: impl Into<String>) -> Self {
        self.details.reference = reference.into();
        self
    }
    pub fn set_priority(mut self, priority: Priority) -> Self {
        self.details.priority = priority;
        self
    }
    pub fn set_project(mut self, project_id: u64) -> Self {
        self.details.project_id = Some(project_id);
        self
    }
    pub fn set_tower(mut self, tower_id: u64) -> Self {
        self.details.tower_id = Some(tower_id);
        self
    }
    pub fn set_area(mut self, area_id: u64) -> Self {
        self.details.area_id = Some(area_id);
        self
    }
    pub fn set_department(mut self, department_id: u64) -> Self {
        self.details.department_id = Some(department_id);
        self
    }
    /// Appends an approver to the end of the chain.
    pub fn add_approver(mut self, approver: UserId) -> Self {
        self.approvers.push(approver);
        self
    }

    // Checks fields and returns the pending request along with its ordered approvers
    pub fn validate_and_finalise(
        self,
        id: RequestId,
        initiator: UserId,
        created: TimeStamp<Utc>,
    ) -> Result<(Request, Vec<UserId>), ChainError> {
        let Some(recommender) = self.recommender else {
            return Err(ChainError::InvalidInput("recommender is not set".into()));
        };
        if self.details.subject.trim().is_empty() {
            return Err(ChainError::InvalidInput("subject is empty".into()));
        }

        if let Some(dup) = first_duplicate(&self.approvers) {
            return Err(ChainError::InvalidInput(format!(
                "{dup} appears more than once in the approval list"
            )));
        }

        let request = Request {
            id,
            initiator,
            recommender,
            last_recommender: self.last_recommender,
            status: RequestStatus::Pending,
            comment: None,
            details: self.details,
            created,
        };

        Ok((request, self.approvers))
    }
}

fn first_duplicate(approvers: &[UserId]) -> Option<&UserId> {
    let mut seen = HashSet::new();
    approvers.iter().find(|a| !seen.insert(*a))
}
