//! Durable chain store on top of sled
//!
//! A request, its chain and its history live in three trees under the same
//! key. Every write goes through a sled transaction spanning all three, so a
//! transition either lands completely or not at all, and two transitions on
//! the same request are serialised: the loser is re-run against the winner's
//! committed state.
use super::chain::Chain;
use super::error::ChainError;
use super::history::{History, HistoryAction};
use super::request::Request;
use super::types::{RequestId, TimeStamp, UserId};
use super::utils::{decode_cbor, encode_cbor};
use sled::transaction::{
    ConflictableTransactionError, TransactionResult, Transactional, TransactionalTree,
};
use sled::{Db, Tree};
use std::sync::Arc;

const REQUESTS: &str = "requests";
const CHAINS: &str = "chains";
const HISTORY: &str = "history";

type TxResult<T> = Result<T, ConflictableTransactionError<ChainError>>;

/// The result of a transition along with what to record in the history.
#[derive(Debug)]
pub struct Mutation<T> {
    pub value: T,
    pub actor: Option<UserId>,
    pub action: HistoryAction,
}

impl<T> Mutation<T> {
    pub fn new(value: T, actor: Option<UserId>, action: HistoryAction) -> Self {
        Self {
            value,
            actor,
            action,
        }
    }
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Mutation<U> {
        Mutation {
            value: f(self.value),
            actor: self.actor,
            action: self.action,
        }
    }
}

#[derive(Clone)]
pub struct ChainStore {
    instance: Arc<Db>,
    requests: Tree,
    chains: Tree,
    history: Tree,
    flush_on_commit: bool,
}

impl ChainStore {
    pub fn new(instance: Arc<Db>) -> Result<Self, ChainError> {
        let requests = instance.open_tree(REQUESTS)?;
        let chains = instance.open_tree(CHAINS)?;
        let history = instance.open_tree(HISTORY)?;

        Ok(Self {
            instance,
            requests,
            chains,
            history,
            flush_on_commit: false,
        })
    }

    /// Flush to disk after every committed transaction.
    pub fn set_flush_on_commit(mut self, flush: bool) -> Self {
        self.flush_on_commit = flush;
        self
    }

    pub fn flushes_on_commit(&self) -> bool {
        self.flush_on_commit
    }

    /// Stores a brand new request with its initial chain.
    pub fn insert_request(&self, request: &Request, chain: &Chain) -> Result<(), ChainError> {
        chain.check_invariants()?;
        let key = request.id.as_bytes();

        let res: TransactionResult<(), ChainError> = (&self.requests, &self.chains, &self.history)
            .transaction(|(requests, chains, history)| {
                if requests.get(key)?.is_some() {
                    return Err(abort(ChainError::Conflict(format!(
                        "request {} already exists",
                        request.id
                    ))));
                }

                let mut log = History::new(request.id.clone());
                log.append(
                    Some(request.initiator.clone()),
                    HistoryAction::Created {
                        approvers: chain.len() as u32,
                    },
                    request.status,
                    request.created.clone(),
                )
                .map_err(abort)?;

                write(requests, key, request)?;
                write(chains, key, chain)?;
                write(history, key, &log)?;
                Ok(())
            });

        res?;
        self.commit()
    }

    /// Runs `f` against the stored request and chain inside one transaction.
    ///
    /// `f` may run more than once when it races another writer of the same
    /// request, so it must not have side effects of its own. The chain is
    /// checked against its invariants before anything is written.
    pub fn mutate<T, F>(&self, request_id: &RequestId, f: F) -> Result<T, ChainError>
    where
        F: Fn(&mut Request, &mut Chain) -> Result<Mutation<T>, ChainError>,
    {
        let key = request_id.as_bytes();

        let res: TransactionResult<T, ChainError> = (&self.requests, &self.chains, &self.history)
            .transaction(|(requests, chains, history)| {
                let Some(mut request) = read::<Request>(requests, key)? else {
                    return Err(abort(ChainError::RequestNotFound(request_id.clone())));
                };
                let mut chain = read::<Chain>(chains, key)?
                    .unwrap_or_else(|| Chain::new(request_id.clone()));
                let mut log = read::<History>(history, key)?
                    .unwrap_or_else(|| History::new(request_id.clone()));

                let mutation = f(&mut request, &mut chain).map_err(abort)?;
                chain.check_invariants().map_err(abort)?;
                log.append(
                    mutation.actor,
                    mutation.action,
                    request.status,
                    TimeStamp::new(),
                )
                .map_err(abort)?;

                write(requests, key, &request)?;
                write(chains, key, &chain)?;
                write(history, key, &log)?;
                Ok(mutation.value)
            });

        let value = res?;
        self.commit()?;
        Ok(value)
    }

    /// Removes a request together with its chain and history.
    pub fn delete_request(&self, request_id: &RequestId) -> Result<Request, ChainError> {
        let key = request_id.as_bytes();

        let res: TransactionResult<Request, ChainError> =
            (&self.requests, &self.chains, &self.history).transaction(
                |(requests, chains, history)| {
                    let Some(request) = read::<Request>(requests, key)? else {
                        return Err(abort(ChainError::RequestNotFound(request_id.clone())));
                    };
                    requests.remove(key)?;
                    chains.remove(key)?;
                    history.remove(key)?;
                    Ok(request)
                },
            );

        let request = res?;
        self.commit()?;
        Ok(request)
    }

    pub fn load_request(&self, request_id: &RequestId) -> Result<Request, ChainError> {
        match self.requests.get(request_id.as_bytes())? {
            Some(bytes) => decode_cbor(&bytes),
            None => Err(ChainError::RequestNotFound(request_id.clone())),
        }
    }

    pub fn load_chain(&self, request_id: &RequestId) -> Result<Chain, ChainError> {
        if !self.requests.contains_key(request_id.as_bytes())? {
            return Err(ChainError::RequestNotFound(request_id.clone()));
        }
        match self.chains.get(request_id.as_bytes())? {
            Some(bytes) => decode_cbor(&bytes),
            None => Ok(Chain::new(request_id.clone())),
        }
    }

    pub fn load_history(&self, request_id: &RequestId) -> Result<History, ChainError> {
        if !self.requests.contains_key(request_id.as_bytes())? {
            return Err(ChainError::RequestNotFound(request_id.clone()));
        }
        match self.history.get(request_id.as_bytes())? {
            Some(bytes) => decode_cbor(&bytes),
            None => Ok(History::new(request_id.clone())),
        }
    }

    /// Every stored request. Reads outside a transaction.
    pub fn requests(&self) -> Result<Vec<Request>, ChainError> {
        self.requests
            .iter()
            .map(|item| {
                let (_, bytes) = item?;
                decode_cbor(&bytes)
            })
            .collect()
    }

    /// Every stored chain. Reads outside a transaction.
    pub fn chains(&self) -> Result<Vec<Chain>, ChainError> {
        self.chains
            .iter()
            .map(|item| {
                let (_, bytes) = item?;
                decode_cbor(&bytes)
            })
            .collect()
    }

    fn commit(&self) -> Result<(), ChainError> {
        if self.flush_on_commit {
            self.instance.flush()?;
        }
        Ok(())
    }
}

fn abort(e: ChainError) -> ConflictableTransactionError<ChainError> {
    ConflictableTransactionError::Abort(e)
}

fn read<T>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(bytes) => decode_cbor(&bytes).map(Some).map_err(abort),
        None => Ok(None),
    }
}

fn write<T: minicbor::Encode<()>>(tree: &TransactionalTree, key: &[u8], value: &T) -> TxResult<()> {
    let bytes = encode_cbor(value).map_err(abort)?;
    tree.insert(key, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestDraft, RequestStatus};

    fn temp_store() -> ChainStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        ChainStore::new(Arc::new(db)).unwrap()
    }

    fn stored_request(store: &ChainStore, approvers: &[&str]) -> RequestId {
        let mut draft = RequestDraft::new()
            .set_recommender("user_rec".into())
            .set_subject("Boundary wall");
        for approver in approvers {
            draft = draft.add_approver((*approver).into());
        }
        let id = RequestId::generate().unwrap();
        let (request, approvers) = draft
            .validate_and_finalise(id.clone(), "user_init".into(), TimeStamp::new())
            .unwrap();
        let chain = Chain::from_approvers(id.clone(), &approvers).unwrap();
        store.insert_request(&request, &chain).unwrap();
        id
    }

    #[test]
    fn insert_then_load() {
        let store = temp_store();
        let id = stored_request(&store, &["user_a", "user_b"]);

        let request = store.load_request(&id).unwrap();
        let chain = store.load_chain(&id).unwrap();
        let history = store.load_history(&id).unwrap();

        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(chain.len(), 2);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn inserting_the_same_id_twice_conflicts() {
        let store = temp_store();
        let id = stored_request(&store, &[]);
        let request = store.load_request(&id).unwrap();

        let res = store.insert_request(&request, &Chain::new(id));
        assert!(matches!(res, Err(ChainError::Conflict(_))));
    }

    #[test]
    fn failed_mutation_writes_nothing() {
        let store = temp_store();
        let id = stored_request(&store, &["user_a"]);

        let res: Result<(), _> = store.mutate(&id, |request, _| {
            request.status = RequestStatus::Completed;
            Err(ChainError::Conflict("boom".into()))
        });

        assert!(res.is_err());
        assert_eq!(store.load_request(&id).unwrap().status, RequestStatus::Pending);
        assert_eq!(store.load_history(&id).unwrap().len(), 1);
    }

    #[test]
    fn mutation_persists_all_three_trees() {
        let store = temp_store();
        let id = stored_request(&store, &["user_a"]);

        let activated = store
            .mutate(&id, |request, chain| {
                let activation = chain.activate_first(&TimeStamp::new());
                request.status = RequestStatus::Initiated;
                Ok(Mutation::new(
                    activation,
                    Some("user_rec".into()),
                    HistoryAction::RecommenderApproved,
                ))
            })
            .unwrap();

        assert_eq!(activated, crate::chain::Activation::Activated("user_a".into()));
        assert_eq!(store.load_request(&id).unwrap().status, RequestStatus::Initiated);
        assert!(store.load_chain(&id).unwrap().active().is_some());
        let history = store.load_history(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.verify().is_ok());
    }

    #[test]
    fn unknown_request_is_not_found() {
        let store = temp_store();
        let id = RequestId::from("nfa_missing");

        assert!(store.load_request(&id).unwrap_err().is_not_found());
        assert!(store.load_chain(&id).unwrap_err().is_not_found());
        let res = store.mutate(&id, |_, _| {
            Ok(Mutation::new((), None, HistoryAction::RecommenderApproved))
        });
        assert!(res.unwrap_err().is_not_found());
    }

    #[test]
    fn delete_cascades() {
        let store = temp_store();
        let id = stored_request(&store, &["user_a"]);

        store.delete_request(&id).unwrap();

        assert!(store.load_request(&id).is_err());
        assert!(store.chains().unwrap().is_empty());
        assert!(store.delete_request(&id).unwrap_err().is_not_found());
    }
}
