//! Agent Module - Signaling-Identität
//!
//! Dieses Modul verwaltet:
//! - Den Agent Controller (Initialisierung, Registrierung, Fallback)
//! - Den Agent Handle (echt oder degradiert)

mod controller;
mod handle;

pub use controller::AgentController;
pub use handle::{AgentHandle, AgentMode, RegistrationState};
