//! Status Reporter
//!
//! Jeder Zustandswechsel und jeder Fehler der Controller landet als
//! lesbarer Text beim Status-Sink. Zusätzlich werden alle Änderungen als
//! `PhoneEvent` über einen Broadcast-Kanal verteilt.

use crate::agent::RegistrationState;
use crate::call::CallPhase;
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// EVENTS
// ============================================================================

/// Events für UI-Schichten
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent {
    /// Neuer Status-Text
    Status(String),
    /// Call-Phase hat sich geändert
    CallPhaseChanged(CallPhase),
    /// Registrierungsstatus hat sich geändert
    RegistrationChanged(RegistrationState),
    /// Audio-Wiedergabe blockiert, manueller Start nötig
    AudioBlocked,
    /// Audio-Wiedergabe läuft
    AudioStarted,
}

// ============================================================================
// STATUS SINK
// ============================================================================

/// Empfänger für Status-Texte (z.B. eine Statuszeile in der UI)
pub trait StatusSink: Send + Sync {
    fn report_status(&self, text: &str);
}

/// Standard-Sink: schreibt nur ins Log
#[derive(Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn report_status(&self, _text: &str) {}
}

// ============================================================================
// STATUS REPORTER
// ============================================================================

/// Verteilt Status-Texte und Events an Sink, Log und Abonnenten
#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
    event_tx: broadcast::Sender<PhoneEvent>,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self { sink, event_tx }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.event_tx.subscribe()
    }

    /// Meldet einen Status-Text (synchron)
    pub fn report(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(status = %text);
        self.sink.report_status(&text);
        let _ = self.event_tx.send(PhoneEvent::Status(text));
    }

    /// Sendet ein Event ohne Status-Text
    pub fn emit(&self, event: PhoneEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(Arc::new(LogStatusSink))
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("subscribers", &self.event_tx.receiver_count())
            .finish()
    }
}
