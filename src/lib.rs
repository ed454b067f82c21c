//! Softphone - SIP/WebRTC Call Core
//!
//! Ein Softphone-Kern mit:
//! - Connectivity Probe vor jedem Verbindungsaufbau
//! - SIP über WebSocket, Audio über WebRTC
//! - Degradiertem Modus ohne Server (simulierte Calls)
//! - Fallback auf einen lokalen Testton bei gescheiterter Verhandlung
//! - SQLite für die Anrufhistorie

pub mod agent;
pub mod call;
pub mod config;
pub mod database;
pub mod media;
pub mod phone;
pub mod signaling;
pub mod status;

#[cfg(test)]
mod testing;

pub use agent::{AgentController, AgentMode, RegistrationState};
pub use call::{CallController, CallError, CallPhase, SessionInfo, SessionMode};
pub use config::{AgentIdentity, PhoneConfig, Timings};
pub use phone::{Collaborators, Softphone};
pub use status::{LogStatusSink, PhoneEvent, StatusReporter, StatusSink};

use tracing_subscriber::EnvFilter;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "softphone=debug,softphone_lib=debug,webrtc=warn";

/// Initialisiert das Logging (einmal pro Prozess)
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Logging already initialized: {}", e);
    }
}
