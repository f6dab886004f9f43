pub mod admin;
pub mod cors;
pub mod inspect;
pub mod limit;
pub mod response;
pub mod router;
pub mod state;

pub use router::router;
pub use state::ApiState;
