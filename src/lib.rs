pub mod chain;
pub mod config;
pub mod directory;
pub mod error;
pub mod history;
pub mod projector;
pub mod request;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use chain::{Chain, ChainMember, MemberStatus};
pub use config::{ConfigError, EngineConfig};
pub use directory::{Directory, SledDirectory};
pub use error::ChainError;
pub use request::{Priority, Request, RequestDraft, RequestStatus};
pub use service::{Action, ActionReceipt, ActorRole, ApprovalEngine, ChainMemberView};
pub use types::{RequestId, SessionToken, TimeStamp, UserId};
