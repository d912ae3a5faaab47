//! Ordered approval chain and the transition rules applied to it
//!
//! Everything in here is pure: callers hand in the current chain and a
//! timestamp, and get back the mutated chain plus a description of what
//! happened. Persisting the result atomically is the store's job.
use super::error::ChainError;
use super::types::{RequestId, TimeStamp, UserId};
use chrono::Utc;
use std::collections::HashSet;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    #[n(0)]
    Waiting,
    /// The active approver. At most one per chain.
    #[n(1)]
    Pending,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    /// Approved as the final member of the chain.
    #[n(4)]
    Complete,
}

impl MemberStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            MemberStatus::Waiting | MemberStatus::Pending => false,
            MemberStatus::Approved | MemberStatus::Rejected | MemberStatus::Complete => true,
        }
    }
    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Waiting => "Waiting",
            MemberStatus::Pending => "Pending",
            MemberStatus::Approved => "Approved",
            MemberStatus::Rejected => "Rejected",
            MemberStatus::Complete => "Complete",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ChainMember {
    #[n(0)]
    pub request_id: RequestId,
    #[n(1)]
    pub approver_id: UserId,
    #[n(2)]
    pub position: u32, // 1-based
    #[n(3)]
    pub status: MemberStatus,
    #[n(4)]
    pub comment: Option<String>,
    #[n(5)]
    pub started: Option<TimeStamp<Utc>>, // set on becoming Pending
    #[n(6)]
    pub completed: Option<TimeStamp<Utc>>, // set on leaving Pending
}

impl ChainMember {
    fn waiting(request_id: RequestId, approver_id: UserId, position: u32) -> Self {
        Self {
            request_id,
            approver_id,
            position,
            status: MemberStatus::Waiting,
            comment: None,
            started: None,
            completed: None,
        }
    }
    fn activate(&mut self, now: &TimeStamp<Utc>) {
        self.status = MemberStatus::Pending;
        self.started = Some(now.clone());
    }
    fn finish(&mut self, status: MemberStatus, comment: Option<String>, now: &TimeStamp<Utc>) {
        self.status = status;
        self.completed = Some(now.clone());
        if comment.is_some() {
            self.comment = comment;
        }
    }
}

/// What an approval did to the rest of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The member at the next position became the active approver.
    Activated(UserId),
    /// The approving member was the last one.
    Exhausted,
}

/// What the recommender's approval did to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// No approvers were ever configured.
    NoChain,
    Activated(UserId),
    /// A member was already active (inserted at position 1 before the recommender acted).
    AlreadyActive(UserId),
    /// Every member has already reached a terminal state.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub removed: ChainMember,
    pub promoted: Option<UserId>,
}

/// The approvers of one request, kept sorted by position.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    #[n(0)]
    pub request_id: RequestId,
    #[n(1)]
    members: Vec<ChainMember>,
}

impl Chain {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            members: vec![],
        }
    }

    /// Builds a chain of `Waiting` members in the given order.
    pub fn from_approvers(request_id: RequestId, approvers: &[UserId]) -> Result<Self, ChainError> {
        let mut chain = Self::new(request_id);
        for approver in approvers {
            if chain.member_of(approver).is_some() {
                return Err(ChainError::Conflict(format!(
                    "{approver} is already in the chain for {}",
                    chain.request_id
                )));
            }
            let position = chain.members.len() as u32 + 1;
            chain.members.push(ChainMember::waiting(
                chain.request_id.clone(),
                approver.clone(),
                position,
            ));
        }
        Ok(chain)
    }

    pub fn members(&self) -> &[ChainMember] {
        &self.members
    }
    pub fn len(&self) -> usize {
        self.members.len()
    }
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
    pub fn member_at(&self, position: u32) -> Option<&ChainMember> {
        let index = (position as usize).checked_sub(1)?;
        self.members.get(index)
    }
    pub fn member_of(&self, approver: &UserId) -> Option<&ChainMember> {
        self.members.iter().find(|m| m.approver_id == *approver)
    }
    /// The member currently in `Pending`.
    pub fn active(&self) -> Option<&ChainMember> {
        self.members
            .iter()
            .find(|m| m.status == MemberStatus::Pending)
    }
    /// True once no member is left to act, including the empty chain.
    pub fn is_exhausted(&self) -> bool {
        self.members.iter().all(|m| m.status.is_terminal())
    }

    fn active_index_for(&self, actor: &UserId) -> Result<usize, ChainError> {
        self.members
            .iter()
            .position(|m| m.status == MemberStatus::Pending && m.approver_id == *actor)
            .ok_or_else(|| ChainError::NotAuthorized {
                request: self.request_id.clone(),
                actor: actor.clone(),
            })
    }

    /// Marks the actor's pending slot approved and activates the next position.
    ///
    /// The final member of the chain is marked `Complete` instead of `Approved`.
    pub fn approve(
        &mut self,
        actor: &UserId,
        comment: Option<String>,
        now: &TimeStamp<Utc>,
    ) -> Result<Advance, ChainError> {
        let index = self.active_index_for(actor)?;

        // validate the successor before anything is touched
        if let Some(next) = self.members.get(index + 1) {
            if next.status != MemberStatus::Waiting {
                return Err(ChainError::Conflict(format!(
                    "member at position {} of {} is {} but should be Waiting",
                    next.position, self.request_id, next.status
                )));
            }
        }

        match self.members.get_mut(index + 1) {
            Some(next) => {
                next.activate(now);
                let next_id = next.approver_id.clone();
                self.members[index].finish(MemberStatus::Approved, comment, now);
                Ok(Advance::Activated(next_id))
            }
            None => {
                self.members[index].finish(MemberStatus::Complete, comment, now);
                Ok(Advance::Exhausted)
            }
        }
    }

    /// Marks the actor's pending slot rejected. Nothing else moves.
    pub fn reject(
        &mut self,
        actor: &UserId,
        comment: Option<String>,
        now: &TimeStamp<Utc>,
    ) -> Result<u32, ChainError> {
        let index = self.active_index_for(actor)?;
        let member = &mut self.members[index];
        member.finish(MemberStatus::Rejected, comment, now);
        Ok(member.position)
    }

    /// Enters the chain after the recommender approved.
    pub fn activate_first(&mut self, now: &TimeStamp<Utc>) -> Activation {
        if self.members.is_empty() {
            return Activation::NoChain;
        }
        if let Some(active) = self.active() {
            return Activation::AlreadyActive(active.approver_id.clone());
        }
        match self.promote_next(now) {
            Some(approver) => Activation::Activated(approver),
            None => Activation::Exhausted,
        }
    }

    /// Inserts `approver` at `position`, shifting everything at or above it up by one.
    ///
    /// Returns the status the new member was given.
    pub fn insert(
        &mut self,
        approver: UserId,
        position: u32,
        now: &TimeStamp<Utc>,
    ) -> Result<MemberStatus, ChainError> {
        let len = self.members.len() as u32;
        if position == 0 || position > len + 1 {
            return Err(ChainError::Conflict(format!(
                "position {position} is outside 1..={} for {}",
                len + 1,
                self.request_id
            )));
        }
        if self.member_of(&approver).is_some() {
            return Err(ChainError::Conflict(format!(
                "{approver} is already in the chain for {}",
                self.request_id
            )));
        }
        // members that have started must keep every Waiting member above them
        let started_floor = self
            .members
            .iter()
            .filter(|m| m.status != MemberStatus::Waiting)
            .map(|m| m.position)
            .max()
            .unwrap_or(0);
        if position <= started_floor {
            return Err(ChainError::Conflict(format!(
                "position {position} lies at or below member {started_floor} which has already started"
            )));
        }

        let mut member = ChainMember::waiting(self.request_id.clone(), approver, position);
        if self.active().is_none() && position == 1 {
            member.activate(now);
        }
        let status = member.status;

        self.members.insert(position as usize - 1, member);
        self.renumber();
        Ok(status)
    }

    /// Removes `approver`, closes the gap, and promotes a successor when nobody is active.
    pub fn remove(&mut self, approver: &UserId, now: &TimeStamp<Utc>) -> Result<Removal, ChainError> {
        let index = self
            .members
            .iter()
            .position(|m| m.approver_id == *approver)
            .ok_or_else(|| ChainError::MemberNotFound {
                request: self.request_id.clone(),
                approver: approver.clone(),
            })?;

        let removed = self.members.remove(index);
        self.renumber();

        let promoted = if self.active().is_none() {
            self.promote_next(now)
        } else {
            None
        };

        Ok(Removal { removed, promoted })
    }

    // lowest position that has not reached a terminal state. Only called when
    // nothing is Pending, so this is always the lowest Waiting member.
    fn promote_next(&mut self, now: &TimeStamp<Utc>) -> Option<UserId> {
        let next = self.members.iter_mut().find(|m| !m.status.is_terminal())?;
        next.activate(now);
        Some(next.approver_id.clone())
    }

    fn renumber(&mut self) {
        for (index, member) in self.members.iter_mut().enumerate() {
            member.position = index as u32 + 1;
        }
    }

    /// Checks every structural invariant of the chain.
    pub fn check_invariants(&self) -> Result<(), ChainError> {
        let mut pending = 0;
        let mut seen_waiting = false;
        let mut approvers = HashSet::new();

        for (index, member) in self.members.iter().enumerate() {
            if !approvers.insert(&member.approver_id) {
                return Err(self.conflict(format!(
                    "{} appears more than once",
                    member.approver_id
                )));
            }
            if member.position != index as u32 + 1 {
                return Err(self.conflict(format!(
                    "member {} sits at position {} but is stored at slot {}",
                    member.approver_id,
                    member.position,
                    index + 1
                )));
            }
            if member.request_id != self.request_id {
                return Err(self.conflict(format!(
                    "member {} belongs to {}",
                    member.approver_id, member.request_id
                )));
            }
            match member.status {
                MemberStatus::Waiting => seen_waiting = true,
                MemberStatus::Pending => {
                    pending += 1;
                    if member.started.is_none() || member.completed.is_some() {
                        return Err(self.conflict(format!(
                            "active member {} has inconsistent timestamps",
                            member.approver_id
                        )));
                    }
                }
                MemberStatus::Approved | MemberStatus::Rejected | MemberStatus::Complete => {}
            }
            if member.status != MemberStatus::Waiting && seen_waiting {
                return Err(self.conflict(format!(
                    "member {} at position {} is {} behind a Waiting member",
                    member.approver_id, member.position, member.status
                )));
            }
        }
        if pending > 1 {
            return Err(self.conflict(format!("{pending} members are Pending")));
        }
        Ok(())
    }

    fn conflict(&self, detail: String) -> ChainError {
        ChainError::Conflict(format!("{}: {detail}", self.request_id))
    }
}
