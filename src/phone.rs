//! Softphone
//!
//! Besitzt Agent Controller, Call Controller, Media Acquirer und die
//! Anrufhistorie. Ersetzt globalen Zustand: jede Instanz ist ein
//! vollständiges, unabhängiges Telefon.

use crate::agent::{AgentController, AgentMode, RegistrationState};
use crate::call::{CallController, CallError, CallPhase, SessionInfo, SessionMode};
use crate::config::PhoneConfig;
use crate::database::{CallLog, CallRecord, DatabaseError};
use crate::media::{
    AudioCapture, CpalCapture, CpalPlayback, CpalTone, MediaAcquirer, PlaybackSink, ToneSynth,
};
use crate::signaling::{ConnectivityProbe, SignalingStack, WsProbe, WsSignaling};
use crate::status::{PhoneEvent, StatusReporter, StatusSink};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Externe Bausteine, die das Telefon benutzt
pub struct Collaborators {
    pub stack: Arc<dyn SignalingStack>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub capture: Arc<dyn AudioCapture>,
    pub tone: Arc<dyn ToneSynth>,
    pub sink: Arc<dyn PlaybackSink>,
}

impl Collaborators {
    /// SIP über WebSocket und cpal Audio
    pub fn native(config: &PhoneConfig) -> Self {
        Self {
            stack: Arc::new(WsSignaling::new(
                config.ice_servers.clone(),
                config.user_agent.clone(),
            )),
            probe: Arc::new(WsProbe),
            capture: Arc::new(CpalCapture),
            tone: Arc::new(CpalTone),
            sink: Arc::new(CpalPlayback::new()),
        }
    }
}

pub struct Softphone {
    config: PhoneConfig,
    status: StatusReporter,
    agent: Arc<AgentController>,
    acquirer: Arc<MediaAcquirer>,
    calls: CallController,
    call_log: Option<Arc<CallLog>>,
}

impl Softphone {
    pub fn new(
        config: PhoneConfig,
        collaborators: Collaborators,
        status_sink: Arc<dyn StatusSink>,
        call_log: Option<Arc<CallLog>>,
    ) -> Self {
        let status = StatusReporter::new(status_sink);
        let agent = Arc::new(AgentController::new(
            collaborators.stack,
            collaborators.probe,
            status.clone(),
            config.timings,
        ));
        let acquirer = Arc::new(MediaAcquirer::new(collaborators.capture));

        let calls = CallController::new(
            Arc::clone(&agent),
            Arc::clone(&acquirer),
            collaborators.tone,
            collaborators.sink,
            status.clone(),
            config.timings,
            config.target_address(),
            call_log.clone(),
        );

        Self {
            config,
            status,
            agent,
            acquirer,
            calls,
            call_log,
        }
    }

    /// Telefon mit nativen Bausteinen. Die Anrufhistorie ist optional:
    /// lässt sie sich nicht öffnen, läuft das Telefon ohne.
    pub fn from_config(config: PhoneConfig, status_sink: Arc<dyn StatusSink>) -> Self {
        let call_log = match CallLog::open() {
            Ok(log) => Some(Arc::new(log)),
            Err(e) => {
                tracing::warn!("Call log unavailable: {}", e);
                None
            }
        };
        let collaborators = Collaborators::native(&config);
        Self::new(config, collaborators, status_sink, call_log)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &PhoneConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.status.subscribe()
    }

    pub fn agent_mode(&self) -> AgentMode {
        self.agent.mode()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.agent.registration_state()
    }

    pub fn phase(&self) -> CallPhase {
        self.calls.phase()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.calls.session()
    }

    /// Die letzten Einträge der Anrufhistorie
    pub fn recent_calls(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        match &self.call_log {
            Some(log) => log.recent(limit),
            None => Ok(Vec::new()),
        }
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Verbindet den Agent mit dem konfigurierten Endpunkt
    pub async fn initialize(&self) -> AgentMode {
        tracing::info!("Initializing softphone as {}", self.config.username);
        self.agent.initialize(self.config.identity()).await
    }

    pub async fn place_call(&self) -> Result<SessionMode, CallError> {
        self.calls.place_call().await
    }

    pub async fn hangup(&self) {
        self.calls.hangup().await
    }

    /// Manueller Start einer blockierten Wiedergabe
    pub fn resume_audio(&self) -> bool {
        self.calls.resume_audio()
    }

    /// Manueller Retry über die alternativen Endpunkte.
    ///
    /// Probiert sie der Reihe nach, bis einer einen echten Agent liefert.
    /// Ohne Alternativen wird der aktuelle Endpunkt neu verbunden.
    pub async fn reconnect(&self) -> AgentMode {
        if self.calls.phase() != CallPhase::Idle {
            self.status.report("already in a call");
            return self.agent.mode();
        }

        if self.config.alternative_endpoints.is_empty() {
            return self.agent.reinitialize(None).await;
        }

        let mut mode = AgentMode::Uninitialized;
        for endpoint in &self.config.alternative_endpoints {
            mode = self.agent.reinitialize(Some(endpoint)).await;
            if mode == AgentMode::Real {
                break;
            }
            tracing::warn!("Alternative endpoint {} not usable", endpoint);
        }
        mode
    }

    /// Legt auf, stoppt den Agent und gibt das Mikrofon frei
    pub async fn shutdown(&self) {
        if self.calls.session().is_some() || self.calls.phase() != CallPhase::Idle {
            self.calls.hangup().await;
        }
        self.agent.shutdown().await;
        self.acquirer.release();
    }
}

impl std::fmt::Debug for Softphone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Softphone")
            .field("agent", &self.agent.mode())
            .field("calls", &self.calls)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
