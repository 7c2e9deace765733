pub mod message;
pub mod session;
pub mod tags;

pub use message::FixMessage;
pub use session::{FixSession, SessionState};
