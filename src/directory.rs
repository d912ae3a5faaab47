//! Who is acting: session resolution and display names
use super::error::ChainError;
use super::types::{SessionToken, TimeStamp, UserId};
use super::utils::{decode_cbor, encode_cbor};
use chrono::Utc;
use sled::{Db, Tree};

const USERS: &str = "users";
const SESSIONS: &str = "sessions";

/// The outside system that knows users and their sessions.
pub trait Directory: Send + Sync {
    /// Maps a session token onto the user it was issued to.
    fn resolve_actor(&self, token: &SessionToken) -> Result<UserId, ChainError>;
    /// Cosmetic only. `None` when the user is unknown.
    fn display_name(&self, user: &UserId) -> Result<Option<String>, ChainError>;
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct UserRecord {
    #[n(0)]
    pub id: UserId,
    #[n(1)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct SessionRecord {
    #[n(0)]
    pub user: UserId,
    #[n(1)]
    pub opened: TimeStamp<Utc>,
}

/// A [`Directory`] kept in the same sled database as the chains.
#[derive(Clone)]
pub struct SledDirectory {
    users: Tree,
    sessions: Tree,
}

impl SledDirectory {
    pub fn new(instance: &Db) -> Result<Self, ChainError> {
        Ok(Self {
            users: instance.open_tree(USERS)?,
            sessions: instance.open_tree(SESSIONS)?,
        })
    }

    /// Mints a fresh user id for `name`.
    pub fn register_user(&self, name: &str) -> Result<UserId, ChainError> {
        let id = UserId::generate()?;
        self.upsert_user(id.clone(), name)?;
        Ok(id)
    }

    /// Stores a user under an id minted elsewhere.
    pub fn upsert_user(&self, id: UserId, name: &str) -> Result<(), ChainError> {
        let record = UserRecord {
            id,
            name: name.to_owned(),
        };
        self.users
            .insert(record.id.as_bytes(), encode_cbor(&record)?)?;
        Ok(())
    }

    pub fn user(&self, id: &UserId) -> Result<Option<UserRecord>, ChainError> {
        self.users
            .get(id.as_bytes())?
            .map(|bytes| decode_cbor(&bytes))
            .transpose()
    }

    pub fn open_session(&self, user: &UserId) -> Result<SessionToken, ChainError> {
        if !self.users.contains_key(user.as_bytes())? {
            return Err(ChainError::InvalidInput(format!("{user} is not registered")));
        }
        let token = SessionToken::generate()?;
        let record = SessionRecord {
            user: user.clone(),
            opened: TimeStamp::new(),
        };
        self.sessions
            .insert(token.as_bytes(), encode_cbor(&record)?)?;
        Ok(token)
    }

    /// Returns true when the session existed.
    pub fn close_session(&self, token: &SessionToken) -> Result<bool, ChainError> {
        Ok(self.sessions.remove(token.as_bytes())?.is_some())
    }
}

impl Directory for SledDirectory {
    fn resolve_actor(&self, token: &SessionToken) -> Result<UserId, ChainError> {
        match self.sessions.get(token.as_bytes())? {
            Some(bytes) => decode_cbor::<SessionRecord>(&bytes).map(|s| s.user),
            None => Err(ChainError::Unauthenticated),
        }
    }

    fn display_name(&self, user: &UserId) -> Result<Option<String>, ChainError> {
        Ok(self.user(user)?.map(|record| record.name))
    }
}
