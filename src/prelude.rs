// Common Traits and Structs
pub use ::common::model::account::Account;
pub use ::common::model::config::{Config, SelectionStrategy};
pub use ::common::model::events::{FailureReason, SessionEvent};
pub use ::common::model::inspect::InspectLink;
pub use ::common::model::item::{ItemData, RawItem, Sticker};
pub use ::common::model::job::{Job, JobLink, SlotOutcome};

// Errors
pub use ::errors::{BoxError, Error, ErrorCode, ErrorKind, Result};

pub mod common {
    pub use ::common::model::account::Account;
    pub use ::common::model::config::Config;
    pub use ::common::model::inspect::InspectLink;
    pub use ::common::model::item::ItemData;
    pub use ::common::model::job::Job;
}
pub mod engine {
    pub use ::engine::Dispatcher;
    pub use ::engine::Fleet;
    pub use ::engine::Runner;
    pub use ::engine::api::ApiState;
    pub use ::engine::api::router;
}
pub mod proxy {
    pub use ::proxy::PoolSession;
    pub use ::proxy::ProxyPool;
    pub use ::proxy::RetryDecision;
    pub use ::proxy::SessionLease;
}
pub mod queue {
    pub use ::queue::CapacityGate;
    pub use ::queue::InspectQueue;
    pub use ::queue::QueueEntry;
    pub use ::queue::QueueHandler;
}
pub mod session {
    pub use ::session::Credentials;
    pub use ::session::SessionSettings;
    pub use ::session::SteamSession;
    pub use ::session::Transport;
    pub use ::session::TransportEvent;
    pub use ::session::TransportFactory;
}
pub mod storage {
    pub use ::storage::CacheFacade;
    pub use ::storage::ItemStore;
    pub use ::storage::MemoryItemStore;
    pub use ::storage::PgItemStore;
    pub use ::storage::StoredItem;
}
pub mod utils {
    pub use ::utils::logger;
    pub use ::utils::rate_limit::FixedWindowRateLimiter;
}
