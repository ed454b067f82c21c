//! Call Session - ein ausgehender Call-Versuch

use crate::media::{MediaError, ToneHandle};
use crate::signaling::Invitation;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Abgelehnte Call-Versuche. Alles andere wird intern abgefangen.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("already in a call")]
    AlreadyInCall,

    #[error("agent not ready")]
    AgentNotReady,

    #[error("microphone permission denied: {0}")]
    MicrophoneDenied(MediaError),

    #[error("call cancelled")]
    Cancelled,
}

// ============================================================================
// MODES & PHASES
// ============================================================================

/// Art der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Echte Verhandlung über den Signaling-Stack
    Real,
    /// Verhandlung fehlgeschlagen, lokaler Testton mit wechselnder Frequenz
    Fallback,
    /// Degradierter Agent, lokaler Testton
    Simulated,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fallback => "fallback",
            Self::Simulated => "simulated",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase der Call-Steuerung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    AcquiringMedia,
    Dialing,
    Established,
    Terminated,
}

// ============================================================================
// SESSION
// ============================================================================

/// Modusabhängiger Teil einer Session
pub(crate) enum SessionKind {
    Real {
        invitation: Arc<dyn Invitation>,
    },
    Fallback {
        tone: Option<Arc<dyn ToneHandle>>,
    },
    Simulated {
        tone: Option<Arc<dyn ToneHandle>>,
    },
}

impl SessionKind {
    pub(crate) fn mode(&self) -> SessionMode {
        match self {
            Self::Real { .. } => SessionMode::Real,
            Self::Fallback { .. } => SessionMode::Fallback,
            Self::Simulated { .. } => SessionMode::Simulated,
        }
    }

    pub(crate) fn tone(&self) -> Option<&Arc<dyn ToneHandle>> {
        match self {
            Self::Fallback { tone } | Self::Simulated { tone } => tone.as_ref(),
            Self::Real { .. } => None,
        }
    }

    pub(crate) fn set_tone(&mut self, new_tone: Arc<dyn ToneHandle>) {
        match self {
            Self::Fallback { tone } | Self::Simulated { tone } => *tone = Some(new_tone),
            Self::Real { .. } => new_tone.close(),
        }
    }

    /// Lokale Ressourcen freigeben (Ton stoppen und schließen)
    pub(crate) fn release(&self) {
        if let Some(tone) = self.tone() {
            tone.stop();
            tone.close();
        }
    }
}

pub(crate) struct CallSession {
    pub(crate) id: String,
    pub(crate) target: String,
    pub(crate) kind: SessionKind,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) established_at: Option<DateTime<Utc>>,
    /// Lokales Auflegen läuft, Established wird unterdrückt
    pub(crate) hanging_up: bool,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl CallSession {
    pub(crate) fn new(target: &str, kind: SessionKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target: target.to_string(),
            kind,
            started_at: Utc::now(),
            established_at: None,
            hanging_up: false,
            task: None,
        }
    }

    pub(crate) fn info(&self, phase: CallPhase) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            target: self.target.clone(),
            mode: self.kind.mode(),
            phase,
            started_at: self.started_at,
            established_at: self.established_at,
        }
    }
}

/// Momentaufnahme der aktiven Session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub target: String,
    pub mode: SessionMode,
    pub phase: CallPhase,
    pub started_at: DateTime<Utc>,
    pub established_at: Option<DateTime<Utc>>,
}
