//! patina: Unified entry point for the patina workspace.
//! This crate re-exports the internal crates so consumers can
//! `use patina::engine::...`, `patina::common::...`, etc.

pub mod prelude;

pub mod common { pub use ::common::*; }
pub mod engine { pub use ::engine::*; }
pub mod errors { pub use ::errors::*; }
pub mod proxy { pub use ::proxy::*; }
pub mod queue { pub use ::queue::*; }
pub mod session { pub use ::session::*; }
pub mod storage { pub use ::storage::*; }
pub mod utils { pub use ::utils::*; }
