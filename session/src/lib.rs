pub mod classify;
pub mod mock;
pub mod session;
pub mod totp;
pub mod transport;

pub use session::{ReadyState, SessionSettings, SteamSession};
pub use transport::{Credentials, Transport, TransportEvent, TransportFactory};
