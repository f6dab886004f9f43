pub mod model;

pub use model::account::{Account, AuthSecret};
pub use model::config::Config;
pub use model::events::{FailureReason, SessionEvent};
pub use model::inspect::InspectLink;
pub use model::item::{ItemData, RawItem, RawSticker, Sticker};
pub use model::job::{Job, JobLink, SlotOutcome};
