pub mod entity;
pub mod facade;
pub mod memory;
pub mod pg;
pub mod store;

pub use facade::CacheFacade;
pub use memory::MemoryItemStore;
pub use pg::PgItemStore;
pub use store::{ItemStore, StoredItem};
