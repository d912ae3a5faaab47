//! Derives a request's coarse status from what just happened to its chain
use super::chain::{Activation, Advance};
use super::request::RequestStatus;

/// A chain transition, as seen by the projector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    RecommenderApproved(Activation),
    RecommenderRejected,
    MemberApproved(Advance),
    MemberRejected,
    MemberInserted,
    MemberRemoved { chain_exhausted: bool },
}

pub fn project(current: RequestStatus, transition: &Transition) -> RequestStatus {
    match transition {
        Transition::RecommenderApproved(activation) => match activation {
            Activation::NoChain | Activation::Exhausted => RequestStatus::Completed,
            Activation::Activated(_) | Activation::AlreadyActive(_) => RequestStatus::Initiated,
        },
        Transition::RecommenderRejected => RequestStatus::Rejected,
        Transition::MemberApproved(advance) => match advance {
            Advance::Activated(_) => RequestStatus::Initiated,
            Advance::Exhausted => RequestStatus::Completed,
        },
        Transition::MemberRejected => RequestStatus::RejectedByApprover,
        Transition::MemberInserted => current,
        // removing the last outstanding approver finishes a running chain
        Transition::MemberRemoved { chain_exhausted } => {
            if *chain_exhausted && current == RequestStatus::Initiated {
                RequestStatus::Completed
            } else {
                current
            }
        }
    }
}
