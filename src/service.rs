//! Service layer API for the approval chain
//!
//! Every transition loads the request and its chain inside one store
//! transaction, checks who may act, applies the pure chain logic, projects
//! the request status and appends to the history before anything commits.
use super::chain::{Chain, ChainMember, MemberStatus, Removal};
use super::config::EngineConfig;
use super::directory::{Directory, SledDirectory};
use super::error::ChainError;
use super::history::{History, HistoryAction};
use super::projector::{Transition, project};
use super::request::{Priority, Request, RequestDraft, RequestStatus};
use super::store::{ChainStore, Mutation};
use super::types::{RequestId, SessionToken, TimeStamp, UserId};
use chrono::Utc;
use sled::Db;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
}

impl FromStr for Action {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Action::Approve),
            "reject" => Ok(Action::Reject),
            other => Err(ChainError::InvalidInput(format!("unknown action '{other}'"))),
        }
    }
}

/// Which seat the actor acted from when going through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    Recommender,
    Approver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReceipt {
    pub request: Request,
    pub role: ActorRole,
}

/// A chain member along with the approver's display name, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMemberView {
    pub member: ChainMember,
    pub approver_name: Option<String>,
}

pub struct ApprovalEngine {
    store: ChainStore,
    directory: Arc<dyn Directory>,
}

impl ApprovalEngine {
    pub fn new(store: ChainStore, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// Engine whose users and sessions live in the same database as the chains.
    pub fn open(instance: Arc<Db>) -> Result<Self, ChainError> {
        Self::with_config(instance, &EngineConfig::default())
    }

    /// Like [`ApprovalEngine::open`], with the store tuned by `config`.
    pub fn with_config(instance: Arc<Db>, config: &EngineConfig) -> Result<Self, ChainError> {
        let directory = SledDirectory::new(&instance)?;
        let store = ChainStore::new(instance)?.set_flush_on_commit(config.flush_on_commit);
        Ok(Self::new(store, Arc::new(directory)))
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    /// Stores a new `Pending` request whose chain holds the draft's approvers in order.
    pub fn create_request(
        &self,
        initiator: &UserId,
        draft: RequestDraft,
    ) -> Result<Request, ChainError> {
        let id = RequestId::generate()?;
        let (request, approvers) =
            draft.validate_and_finalise(id.clone(), initiator.clone(), TimeStamp::new())?;
        let chain = Chain::from_approvers(id, &approvers)?;

        self.store.insert_request(&request, &chain)?;
        info!(
            request_id = %request.id,
            initiator = %initiator,
            approvers = chain.len(),
            "request created"
        );
        Ok(request)
    }

    pub fn get_request(&self, request_id: &RequestId) -> Result<Request, ChainError> {
        self.store.load_request(request_id)
    }

    /// Removes the request along with its chain and history.
    pub fn delete_request(&self, request_id: &RequestId) -> Result<Request, ChainError> {
        let request = self.store.delete_request(request_id)?;
        info!(request_id = %request_id, "request deleted");
        Ok(request)
    }

    /// The recommender's decision, taken while the request is still `Pending`.
    pub fn recommender_act(
        &self,
        request_id: &RequestId,
        actor: &UserId,
        action: Action,
        comment: Option<String>,
    ) -> Result<Request, ChainError> {
        let request = self
            .store
            .mutate(request_id, |request, chain| {
                recommender_step(request, chain, actor, action, comment.clone(), &TimeStamp::new())
                    .map(|m| m.map(|_| request.clone()))
            })
            .inspect_err(|e| {
                debug!(request_id = %request_id, actor = %actor, error = %e, "recommender action refused")
            })?;

        info!(request_id = %request_id, actor = %actor, status = %request.status, "recommender acted");
        Ok(request)
    }

    /// Approves the actor's pending slot and hands the chain to the next position.
    pub fn approve_step(
        &self,
        request_id: &RequestId,
        actor: &UserId,
        comment: Option<String>,
    ) -> Result<Request, ChainError> {
        self.approver_act(request_id, actor, Action::Approve, comment)
    }

    pub fn reject_step(
        &self,
        request_id: &RequestId,
        actor: &UserId,
        comment: Option<String>,
    ) -> Result<Request, ChainError> {
        self.approver_act(request_id, actor, Action::Reject, comment)
    }

    fn approver_act(
        &self,
        request_id: &RequestId,
        actor: &UserId,
        action: Action,
        comment: Option<String>,
    ) -> Result<Request, ChainError> {
        let request = self
            .store
            .mutate(request_id, |request, chain| {
                approver_step(request, chain, actor, action, comment.clone(), &TimeStamp::new())
                    .map(|m| m.map(|_| request.clone()))
            })
            .inspect_err(|e| {
                debug!(request_id = %request_id, actor = %actor, error = %e, "approver action refused")
            })?;

        info!(request_id = %request_id, actor = %actor, ?action, status = %request.status, "approver acted");
        Ok(request)
    }

    /// Single entry point for "approve" and "reject".
    ///
    /// The pending recommender acts as the recommender; the owner of the
    /// `Pending` chain slot acts as an approver; anyone else is `Forbidden`.
    /// The check and the transition commit together.
    pub fn approve_or_reject(
        &self,
        request_id: &RequestId,
        actor: &UserId,
        action: Action,
        comment: Option<String>,
    ) -> Result<ActionReceipt, ChainError> {
        let receipt = self
            .store
            .mutate(request_id, |request, chain| {
                let now = TimeStamp::new();
                let is_recommender =
                    request.recommender == *actor && request.status == RequestStatus::Pending;
                let is_active_approver = !request.status.is_terminal()
                    && chain.active().is_some_and(|m| m.approver_id == *actor);

                let (mutation, role) = if is_recommender {
                    let m = recommender_step(request, chain, actor, action, comment.clone(), &now)?;
                    (m, ActorRole::Recommender)
                } else if is_active_approver {
                    let m = approver_step(request, chain, actor, action, comment.clone(), &now)?;
                    (m, ActorRole::Approver)
                } else {
                    return Err(ChainError::Forbidden {
                        request: request.id.clone(),
                        actor: actor.clone(),
                    });
                };

                Ok(mutation.map(|_| ActionReceipt {
                    request: request.clone(),
                    role,
                }))
            })
            .inspect_err(|e| {
                debug!(request_id = %request_id, actor = %actor, error = %e, "action refused")
            })?;

        info!(
            request_id = %request_id,
            actor = %actor,
            role = ?receipt.role,
            ?action,
            status = %receipt.request.status,
            "action applied"
        );
        Ok(receipt)
    }

    /// Resolves the session's user through the directory, then runs the gate.
    pub fn act_with_session(
        &self,
        token: &SessionToken,
        request_id: &RequestId,
        action: Action,
        comment: Option<String>,
    ) -> Result<ActionReceipt, ChainError> {
        let actor = self
            .directory
            .resolve_actor(token)
            .inspect_err(|e| {
                debug!(request_id = %request_id, error = %e, "session rejected")
            })?;
        self.approve_or_reject(request_id, &actor, action, comment)
    }

    /// Inserts `approver` at `position`, shifting later members up.
    pub fn insert_approver(
        &self,
        request_id: &RequestId,
        approver: &UserId,
        position: u32,
    ) -> Result<ChainMember, ChainError> {
        let member = self
            .store
            .mutate(request_id, |request, chain| {
                ensure_open(request)?;
                chain.insert(approver.clone(), position, &TimeStamp::new())?;
                request.status = project(request.status, &Transition::MemberInserted);

                let member = chain
                    .member_at(position)
                    .cloned()
                    .ok_or_else(|| missing_member(request, approver))?;
                Ok(Mutation::new(
                    member,
                    None,
                    HistoryAction::Inserted {
                        approver: approver.clone(),
                        position,
                    },
                ))
            })
            .inspect_err(|e| {
                debug!(request_id = %request_id, approver = %approver, error = %e, "insert refused")
            })?;

        info!(
            request_id = %request_id,
            approver = %approver,
            position,
            status = %member.status,
            "approver inserted"
        );
        Ok(member)
    }

    /// Removes `approver`, closes the gap and promotes a successor when nobody is active.
    pub fn remove_approver(
        &self,
        request_id: &RequestId,
        approver: &UserId,
    ) -> Result<Removal, ChainError> {
        let removal = self
            .store
            .mutate(request_id, |request, chain| {
                ensure_open(request)?;
                let removal = chain.remove(approver, &TimeStamp::new())?;
                request.status = project(
                    request.status,
                    &Transition::MemberRemoved {
                        chain_exhausted: chain.is_exhausted(),
                    },
                );

                let position = removal.removed.position;
                Ok(Mutation::new(
                    removal,
                    None,
                    HistoryAction::Removed {
                        approver: approver.clone(),
                        position,
                    },
                ))
            })
            .inspect_err(|e| {
                debug!(request_id = %request_id, approver = %approver, error = %e, "removal refused")
            })?;

        info!(
            request_id = %request_id,
            approver = %approver,
            promoted = ?removal.promoted,
            "approver removed"
        );
        Ok(removal)
    }

    /// Every member of the chain in position order.
    pub fn get_chain(&self, request_id: &RequestId) -> Result<Vec<ChainMemberView>, ChainError> {
        let chain = self.store.load_chain(request_id)?;
        self.views(chain.members().iter())
    }

    /// The chain without members that already signed off as final approver.
    ///
    /// Once the request is closed nobody is waiting on it, so a member left
    /// `Pending` by a rejection upstream of the chain is hidden as well.
    pub fn get_pending_chain(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ChainMemberView>, ChainError> {
        let closed = self.store.load_request(request_id)?.status.is_terminal();
        let chain = self.store.load_chain(request_id)?;
        self.views(chain.members().iter().filter(|m| match m.status {
            MemberStatus::Complete => false,
            MemberStatus::Pending => !closed,
            _ => true,
        }))
    }

    fn views<'a>(
        &self,
        members: impl Iterator<Item = &'a ChainMember>,
    ) -> Result<Vec<ChainMemberView>, ChainError> {
        members
            .map(|member| -> Result<ChainMemberView, ChainError> {
                Ok(ChainMemberView {
                    approver_name: self.directory.display_name(&member.approver_id)?,
                    member: member.clone(),
                })
            })
            .collect()
    }

    /// Requests where `user` holds the active slot, longest waiting first.
    pub fn pending_approvals(&self, user: &UserId) -> Result<Vec<Request>, ChainError> {
        let mut waiting: Vec<(TimeStamp<Utc>, RequestId)> = self
            .store
            .chains()?
            .into_iter()
            .filter_map(|chain| {
                let active = chain.active()?;
                if active.approver_id != *user {
                    return None;
                }
                Some((active.started.clone()?, chain.request_id.clone()))
            })
            .collect();
        waiting.sort();

        let mut requests = Vec::with_capacity(waiting.len());
        for (_, request_id) in waiting {
            match self.store.load_request(&request_id) {
                Ok(request) if !request.status.is_terminal() => requests.push(request),
                Ok(_) => {}
                // deleted between the scan and the load
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(requests)
    }

    pub fn requests_by_initiator(&self, user: &UserId) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|r| r.initiator == *user)
    }

    pub fn requests_by_recommender(&self, user: &UserId) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|r| r.recommender == *user)
    }

    /// Every stored request, oldest first.
    pub fn all_requests(&self) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|_| true)
    }

    pub fn requests_by_project(&self, project_id: u64) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|r| r.details.project_id == Some(project_id))
    }

    pub fn requests_by_department(&self, department_id: u64) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|r| r.details.department_id == Some(department_id))
    }

    pub fn requests_by_area(&self, area_id: u64) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|r| r.details.area_id == Some(area_id))
    }

    pub fn requests_by_tower(&self, tower_id: u64) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|r| r.details.tower_id == Some(tower_id))
    }

    pub fn requests_by_priority(&self, priority: Priority) -> Result<Vec<Request>, ChainError> {
        self.requests_where(|r| r.details.priority == priority)
    }

    fn requests_where(&self, pred: impl Fn(&Request) -> bool) -> Result<Vec<Request>, ChainError> {
        let mut requests: Vec<Request> = self
            .store
            .requests()?
            .into_iter()
            .filter(|r| pred(r))
            .collect();
        requests.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(requests)
    }

    pub fn history(&self, request_id: &RequestId) -> Result<History, ChainError> {
        self.store.load_history(request_id)
    }

    /// Recomputes every link of the request's history.
    pub fn verify_history(&self, request_id: &RequestId) -> Result<(), ChainError> {
        self.store.load_history(request_id)?.verify()
    }
}

fn recommender_step(
    request: &mut Request,
    chain: &mut Chain,
    actor: &UserId,
    action: Action,
    comment: Option<String>,
    now: &TimeStamp<Utc>,
) -> Result<Mutation<()>, ChainError> {
    if request.recommender != *actor || request.status != RequestStatus::Pending {
        return Err(ChainError::NotAuthorized {
            request: request.id.clone(),
            actor: actor.clone(),
        });
    }

    let action = match action {
        Action::Approve => {
            let activation = chain.activate_first(now);
            request.status = project(
                request.status,
                &Transition::RecommenderApproved(activation),
            );
            HistoryAction::RecommenderApproved
        }
        Action::Reject => {
            request.status = project(request.status, &Transition::RecommenderRejected);
            request.comment = comment.clone();
            HistoryAction::RecommenderRejected { comment }
        }
    };
    Ok(Mutation::new((), Some(actor.clone()), action))
}

fn approver_step(
    request: &mut Request,
    chain: &mut Chain,
    actor: &UserId,
    action: Action,
    comment: Option<String>,
    now: &TimeStamp<Utc>,
) -> Result<Mutation<()>, ChainError> {
    if request.status.is_terminal() {
        return Err(ChainError::NotAuthorized {
            request: request.id.clone(),
            actor: actor.clone(),
        });
    }

    let action = match action {
        Action::Approve => {
            let advance = chain.approve(actor, comment, now)?;
            request.status = project(request.status, &Transition::MemberApproved(advance));
            HistoryAction::Approved {
                position: position_of(chain, actor),
            }
        }
        Action::Reject => {
            let position = chain.reject(actor, comment.clone(), now)?;
            request.status = project(request.status, &Transition::MemberRejected);
            HistoryAction::Rejected { position, comment }
        }
    };
    Ok(Mutation::new((), Some(actor.clone()), action))
}

fn ensure_open(request: &Request) -> Result<(), ChainError> {
    if request.status.is_terminal() {
        return Err(ChainError::Conflict(format!(
            "request {} is already {}",
            request.id, request.status
        )));
    }
    Ok(())
}

fn position_of(chain: &Chain, approver: &UserId) -> u32 {
    chain.member_of(approver).map_or(0, |m| m.position)
}

fn missing_member(request: &Request, approver: &UserId) -> ChainError {
    ChainError::MemberNotFound {
        request: request.id.clone(),
        approver: approver.clone(),
    }
}
