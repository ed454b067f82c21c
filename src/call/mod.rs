//! Call Session Controller
//!
//! Ein ausgehender Call pro Prozess, echt, als Fallback oder simuliert.

mod controller;
mod session;

pub use controller::CallController;
pub use session::{CallError, CallPhase, SessionInfo, SessionMode};
