//! Call Session Controller
//!
//! Zustandsmaschine eines ausgehenden Anrufs:
//! `Idle → AcquiringMedia → Dialing → Established → Terminated → Idle`
//!
//! - Degradierter Agent: Simulated Session mit Testton nach fester Aufbauzeit
//! - Echter Agent: Invitation; scheitert sie, wird daraus eine Fallback
//!   Session mit wechselnder Tonhöhe
//!
//! Jede Session hat einen eigenen Task, der die Events der Invitation in
//! Lieferreihenfolge abarbeitet. Eine Generationsnummer erkennt veraltete
//! Tasks nach Auflegen oder Abbruch.

use super::session::{CallError, CallPhase, CallSession, SessionInfo, SessionKind, SessionMode};
use crate::agent::{AgentController, AgentHandle};
use crate::config::{Timings, FALLBACK_MAX_OFFSET_HZ, TONE_FREQUENCY_HZ, TONE_GAIN};
use crate::database::{CallLog, CallOutcome, CallRecord, DatabaseError};
use crate::media::{Acquisition, MediaAcquirer, MediaError, PlaybackError, PlaybackSink, ToneSynth};
use crate::signaling::{
    Invitation, MediaOptions, RemoteTrack, SessionEvent, SessionState, SignalingError, SipUri,
    UserAgent,
};
use crate::status::{PhoneEvent, StatusReporter};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Default)]
struct CallSlot {
    generation: u64,
    phase: CallPhase,
    session: Option<CallSession>,
}

/// Von Controller und Session-Tasks gemeinsam genutzt
struct Shared {
    slot: Mutex<CallSlot>,
    status: StatusReporter,
    tone: Arc<dyn ToneSynth>,
    sink: Arc<dyn PlaybackSink>,
    timings: Timings,
    /// Track, dessen Wiedergabe blockiert wurde
    blocked_track: Mutex<Option<RemoteTrack>>,
    call_log: Option<Arc<CallLog>>,
}

/// Wie der Call nach dem Anlegen der Session weiterläuft
enum Start {
    Simulated,
    Real(Arc<dyn Invitation>, broadcast::Receiver<SessionEvent>),
    Fallback(SignalingError),
}

impl Start {
    fn session_kind(&self) -> SessionKind {
        match self {
            Self::Simulated => SessionKind::Simulated { tone: None },
            Self::Real(invitation, _) => SessionKind::Real {
                invitation: Arc::clone(invitation),
            },
            Self::Fallback(_) => SessionKind::Fallback { tone: None },
        }
    }
}

/// Besitzt höchstens eine CallSession
pub struct CallController {
    agent: Arc<AgentController>,
    acquirer: Arc<MediaAcquirer>,
    shared: Arc<Shared>,
    target: String,
}

impl CallController {
    /// `call_log` bekommt jeden Call-Versuch, `None` schreibt keine Historie
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<AgentController>,
        acquirer: Arc<MediaAcquirer>,
        tone: Arc<dyn ToneSynth>,
        sink: Arc<dyn PlaybackSink>,
        status: StatusReporter,
        timings: Timings,
        target: impl Into<String>,
        call_log: Option<Arc<CallLog>>,
    ) -> Self {
        Self {
            agent,
            acquirer,
            shared: Arc::new(Shared {
                slot: Mutex::new(CallSlot::default()),
                status,
                tone,
                sink,
                timings,
                blocked_track: Mutex::new(None),
                call_log,
            }),
            target: target.into(),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.shared.slot.lock().phase
    }

    /// Momentaufnahme der aktiven Session
    pub fn session(&self) -> Option<SessionInfo> {
        let slot = self.shared.slot.lock();
        slot.session.as_ref().map(|s| s.info(slot.phase))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    // ========================================================================
    // PLACE CALL
    // ========================================================================

    /// Ruft das konfigurierte Ziel an
    pub async fn place_call(&self) -> Result<SessionMode, CallError> {
        let target = self.target.clone();
        self.dial(&target).await
    }

    /// Startet einen Call-Versuch zu `target`.
    ///
    /// Kehrt zurück, sobald die Session angelegt ist; der weitere Verlauf
    /// läuft im Session-Task und wird über Status und Events gemeldet.
    pub async fn dial(&self, target: &str) -> Result<SessionMode, CallError> {
        let generation = {
            let mut guard = self.shared.slot.lock();
            let slot = &mut *guard;
            if slot.phase != CallPhase::Idle {
                None
            } else if !self.agent.is_ready() {
                Some(Err(CallError::AgentNotReady))
            } else {
                slot.generation += 1;
                slot.phase = CallPhase::AcquiringMedia;
                Some(Ok(slot.generation))
            }
        };
        let generation = match generation {
            None => {
                self.shared.status.report("already in a call");
                return Err(CallError::AlreadyInCall);
            }
            Some(Err(e)) => {
                self.shared.status.report("agent not ready");
                return Err(e);
            }
            Some(Ok(generation)) => generation,
        };
        self.shared.emit_phase(CallPhase::AcquiringMedia);

        // Mikrofon, höchstens einmal pro Prozess
        if let Err(e) = self.acquire_media().await {
            if self.shared.reset_pending(generation) {
                self.shared.status.report("microphone permission denied");
            }
            return Err(CallError::MicrophoneDenied(e));
        }

        let Some(handle) = self.agent.handle() else {
            if !self.shared.reset_pending(generation) {
                return Err(CallError::Cancelled);
            }
            self.shared.status.report("agent not ready");
            return Err(CallError::AgentNotReady);
        };

        let start = match handle.as_ref() {
            AgentHandle::Real { agent, .. } => self.create_invitation(target, agent),
            AgentHandle::Degraded => Start::Simulated,
        };
        let session = CallSession::new(target, start.session_kind());
        let mode = session.kind.mode();
        // Session und Dialing im selben Schritt, sonst sieht hangup() keine Session
        if !self.shared.begin_dialing(generation, session) {
            return Err(CallError::Cancelled);
        }
        self.shared.emit_phase(CallPhase::Dialing);

        let shared = Arc::clone(&self.shared);
        let task = match start {
            Start::Simulated => {
                self.shared.status.report("Initiating simulated call...");
                tokio::spawn(async move {
                    tokio::time::sleep(shared.timings.setup_delay).await;
                    shared.establish_synthetic(generation);
                })
            }
            Start::Real(invitation, events) => {
                self.shared.status.report(format!("Calling {}...", target));
                tokio::spawn(shared.run_real(generation, invitation, events))
            }
            Start::Fallback(e) => {
                self.shared.status.report(format!("Calling {}...", target));
                tokio::spawn(shared.run_fallback(generation, e))
            }
        };
        self.shared.attach_task(generation, task);
        Ok(mode)
    }

    async fn acquire_media(&self) -> Result<(), MediaError> {
        if self.acquirer.current().is_some() || self.acquirer.is_in_flight() {
            return Ok(());
        }
        self.shared.status.report("Requesting microphone…");
        if let Acquisition::Acquired(_) = self.acquirer.acquire().await? {
            self.shared.status.report("Microphone ready");
        }
        Ok(())
    }

    /// Invitation mit dem Mikrofon-Stream. Scheitert das Anlegen, wird
    /// der Call zum Fallback.
    fn create_invitation(&self, target: &str, agent: &Arc<dyn UserAgent>) -> Start {
        let media = MediaOptions::audio(self.acquirer.current());
        let invitation = SipUri::parse(target)
            .ok_or_else(|| SignalingError::InvalidUri(target.to_string()))
            .and_then(|uri| agent.create_invitation(uri, media));

        match invitation {
            Ok(invitation) => {
                let events = invitation.subscribe();
                Start::Real(invitation, events)
            }
            Err(e) => Start::Fallback(e),
        }
    }

    // ========================================================================
    // HANGUP
    // ========================================================================

    /// Beendet die aktive Session. Ohne Session nur eine Statusmeldung.
    pub async fn hangup(&self) {
        enum Action {
            Nothing,
            AlreadyHangingUp,
            CancelAcquire,
            Release(CallSession),
            Terminate(u64, Arc<dyn Invitation>),
        }

        let action = {
            let mut guard = self.shared.slot.lock();
            let slot = &mut *guard;
            // Real: Invitation und ob schon aufgelegt wird
            let real = slot.session.as_mut().map(|session| match &session.kind {
                SessionKind::Real { invitation } => Some((
                    Arc::clone(invitation),
                    std::mem::replace(&mut session.hanging_up, true),
                )),
                _ => None,
            });
            match real {
                None if slot.phase == CallPhase::AcquiringMedia => {
                    slot.generation += 1;
                    slot.phase = CallPhase::Idle;
                    Action::CancelAcquire
                }
                None => Action::Nothing,
                Some(Some((_, true))) => Action::AlreadyHangingUp,
                Some(Some((invitation, false))) => Action::Terminate(slot.generation, invitation),
                Some(None) => {
                    slot.phase = CallPhase::Idle;
                    slot.session.take().map_or(Action::Nothing, Action::Release)
                }
            }
        };

        match action {
            Action::Nothing => self.shared.status.report("No active call"),
            Action::AlreadyHangingUp => self.shared.status.report("Hangup already in progress"),
            Action::CancelAcquire => {
                self.shared.emit_phase(CallPhase::Idle);
                self.shared.status.report("Call cancelled");
            }
            Action::Release(session) => {
                let text = match (session.kind.mode(), session.established_at) {
                    (_, None) => "Call cancelled",
                    (SessionMode::Fallback, _) => "Fallback call ended",
                    _ => "Simulated call ended",
                };
                self.shared.release(session, text);
            }
            Action::Terminate(generation, invitation) => {
                self.shared.status.report("Hanging up...");
                if let Err(e) = invitation.terminate().await {
                    tracing::warn!("Terminate failed, forcing cleanup: {}", e);
                    self.shared.finish(generation, "Call ended (forced cleanup)");
                }
            }
        }
    }

    // ========================================================================
    // AUDIO
    // ========================================================================

    /// Startet eine blockierte Wiedergabe erneut (Nutzergeste)
    pub fn resume_audio(&self) -> bool {
        let Some(track) = self.shared.blocked_track.lock().take() else {
            self.shared.status.report("No blocked audio");
            return false;
        };
        if self.shared.slot.lock().session.is_none() {
            return false;
        }
        self.shared.play(track)
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("target", &self.target)
            .field("phase", &self.phase())
            .finish()
    }
}

// ============================================================================
// SESSION TASKS
// ============================================================================

impl Shared {
    fn emit_phase(&self, phase: CallPhase) {
        tracing::debug!("Call phase: {:?}", phase);
        self.status.emit(PhoneEvent::CallPhaseChanged(phase));
    }

    fn is_current(&self, generation: u64) -> bool {
        let slot = self.slot.lock();
        slot.generation == generation && slot.session.is_some()
    }

    /// Setzt einen Versuch ohne Session zurück. `false` wenn er schon
    /// abgebrochen wurde.
    fn reset_pending(&self, generation: u64) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.phase != CallPhase::AcquiringMedia {
                return false;
            }
            slot.phase = CallPhase::Idle;
        }
        self.emit_phase(CallPhase::Idle);
        true
    }

    /// Legt die Session an und wechselt nach Dialing. `false` wenn der
    /// Versuch inzwischen abgebrochen wurde.
    fn begin_dialing(&self, generation: u64, session: CallSession) -> bool {
        let record = CallRecord {
            id: session.id.clone(),
            target: session.target.clone(),
            mode: session.kind.mode().as_str().to_string(),
            outcome: CallOutcome::Active,
            started_at: session.started_at,
            established_at: None,
            ended_at: None,
        };
        {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.phase != CallPhase::AcquiringMedia {
                return false;
            }
            slot.phase = CallPhase::Dialing;
            slot.session = Some(session);
        }
        self.record(|log| log.insert(&record));
        true
    }

    fn attach_task(&self, generation: u64, task: JoinHandle<()>) {
        let mut guard = self.slot.lock();
        let slot = &mut *guard;
        match slot.session.as_mut() {
            Some(session) if slot.generation == generation => session.task = Some(task),
            _ => task.abort(),
        }
    }

    fn record<T>(&self, write: impl FnOnce(&CallLog) -> Result<T, DatabaseError>) {
        if let Some(log) = &self.call_log {
            if let Err(e) = write(log) {
                tracing::warn!("Failed to update call log: {}", e);
            }
        }
    }

    /// Verhandlung über die Invitation, Events in Lieferreihenfolge
    async fn run_real(
        self: Arc<Self>,
        generation: u64,
        invitation: Arc<dyn Invitation>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) {
        let mut invite = invitation.invite();
        let mut invite_pending = true;

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => {
                        if !self.handle_session_event(generation, event) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Session listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                result = &mut invite, if invite_pending => {
                    invite_pending = false;
                    if let Err(e) = result {
                        drop(events);
                        self.run_fallback(generation, e).await;
                        return;
                    }
                }
            }
        }
    }

    /// `false` sobald die Session beendet ist
    fn handle_session_event(&self, generation: u64, event: SessionEvent) -> bool {
        if !self.is_current(generation) {
            return false;
        }

        match event {
            SessionEvent::StateChanged(SessionState::Establishing) => {
                self.status.report("Call establishing...");
                true
            }
            SessionEvent::StateChanged(SessionState::Established) => {
                let established = {
                    let mut guard = self.slot.lock();
                    let slot = &mut *guard;
                    match slot.session.as_mut() {
                        Some(session) if !session.hanging_up => {
                            let at = Utc::now();
                            session.established_at = Some(at);
                            slot.phase = CallPhase::Established;
                            Some((session.id.clone(), at))
                        }
                        _ => None,
                    }
                };
                if let Some((id, at)) = established {
                    self.emit_phase(CallPhase::Established);
                    self.record(|log| log.mark_established(&id, at));
                    self.status.report("Call established");
                }
                true
            }
            SessionEvent::StateChanged(SessionState::Terminated) => {
                let (local, established) = self
                    .slot
                    .lock()
                    .session
                    .as_ref()
                    .map(|s| (s.hanging_up, s.established_at.is_some()))
                    .unwrap_or_default();
                let text = match (local, established) {
                    (true, true) => "Call ended",
                    (true, false) => "Call cancelled",
                    (false, _) => "Remote party hung up",
                };
                self.finish(generation, text);
                false
            }
            SessionEvent::TrackAdded(track) => {
                self.play(track);
                true
            }
        }
    }

    /// Verhandlung gescheitert: lokaler Testton statt Fehler
    async fn run_fallback(self: Arc<Self>, generation: u64, error: SignalingError) {
        tracing::warn!("Invitation failed: {}", error);

        let cancelled = {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return;
            }
            match slot.session.as_mut() {
                Some(session) if session.hanging_up => true,
                Some(session) => {
                    session.kind = SessionKind::Fallback { tone: None };
                    false
                }
                None => return,
            }
        };
        if cancelled {
            self.finish(generation, "Call cancelled");
            return;
        }

        if let Some(id) = self.session_id(generation) {
            self.record(|log| log.set_mode(&id, SessionMode::Fallback.as_str()));
        }
        self.status
            .report(format!("Call failed ({}) - falling back to test audio", error));

        tokio::time::sleep(self.timings.setup_delay).await;
        if !self.establish_synthetic(generation) {
            return;
        }

        let interval = self.timings.fallback_wobble_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            if !self.wobble(generation) {
                break;
            }
        }
    }

    fn session_id(&self, generation: u64) -> Option<String> {
        let slot = self.slot.lock();
        if slot.generation != generation {
            return None;
        }
        slot.session.as_ref().map(|s| s.id.clone())
    }

    /// Startet den Testton und markiert die Session als verbunden
    fn establish_synthetic(&self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }

        let tone = self
            .tone
            .create_tone(TONE_FREQUENCY_HZ, TONE_GAIN)
            .and_then(|tone| tone.start().map(|_| tone));

        let established = {
            let mut guard = self.slot.lock();
            let slot = &mut *guard;
            match slot.session.as_mut() {
                Some(session) if slot.generation == generation => {
                    let at = Utc::now();
                    if let Ok(tone) = &tone {
                        session.kind.set_tone(Arc::clone(tone));
                    }
                    session.established_at = Some(at);
                    slot.phase = CallPhase::Established;
                    Some((session.id.clone(), session.kind.mode(), at))
                }
                _ => None,
            }
        };

        let Some((id, mode, at)) = established else {
            // Inzwischen aufgelegt
            if let Ok(tone) = tone {
                tone.stop();
                tone.close();
            }
            return false;
        };

        self.emit_phase(CallPhase::Established);
        self.record(|log| log.mark_established(&id, at));
        if let Err(e) = &tone {
            tracing::error!("Test tone unavailable: {}", e);
            self.status.report(format!("Test audio unavailable: {}", e));
        }
        self.status.report(match mode {
            SessionMode::Fallback => "Fallback call connected - playing test audio",
            _ => "Simulated call connected - playing test audio",
        });
        true
    }

    /// Verschiebt die Fallback-Tonhöhe um einen zufälligen Versatz
    fn wobble(&self, generation: u64) -> bool {
        let tone = {
            let slot = self.slot.lock();
            if slot.generation != generation {
                return false;
            }
            match slot.session.as_ref().and_then(|s| s.kind.tone()) {
                Some(tone) => Arc::clone(tone),
                None => return false,
            }
        };

        let frequency = TONE_FREQUENCY_HZ + random_offset() as f32;
        tracing::debug!("Fallback tone now {} Hz", frequency);
        tone.set_frequency(frequency);
        true
    }

    /// Gibt die Session frei, falls sie noch zur Generation gehört
    fn finish(&self, generation: u64, text: &str) {
        let session = {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return;
            }
            let session = slot.session.take();
            if session.is_some() {
                slot.phase = CallPhase::Idle;
            }
            session
        };
        if let Some(session) = session {
            self.release(session, text);
        }
    }

    /// Räumt eine bereits entnommene Session auf
    fn release(&self, session: CallSession, text: &str) {
        if let Some(task) = &session.task {
            task.abort();
        }
        session.kind.release();
        self.sink.detach();
        self.blocked_track.lock().take();

        self.record(|log| log.finish(&session.id, Utc::now()));
        self.emit_phase(CallPhase::Terminated);
        self.emit_phase(CallPhase::Idle);
        self.status.report(text);
    }

    /// Hängt einen Remote-Track an die Ausgabe. Kein echter Audio-Track:
    /// Wiedergabe über die Verarbeitungskette.
    fn play(&self, track: RemoteTrack) -> bool {
        let result = if track.is_audio_track() {
            self.sink.play(track)
        } else {
            tracing::warn!(
                "Track {} is not a plain audio track ({:?}), using processing chain",
                track.id,
                track.kind
            );
            self.sink.play_processed(track)
        };

        match result {
            Ok(()) => {
                self.status.emit(PhoneEvent::AudioStarted);
                self.status.report("Remote audio playing");
                true
            }
            Err(PlaybackError::Blocked { track, reason }) => {
                tracing::warn!("Playback blocked: {}", reason);
                *self.blocked_track.lock() = Some(track);
                self.status.emit(PhoneEvent::AudioBlocked);
                self.status.report("Audio blocked - start audio manually");
                false
            }
            Err(PlaybackError::Device(e)) => {
                tracing::error!("Playback failed: {}", e);
                self.status.report(format!("Audio output unavailable: {}", e));
                false
            }
        }
    }
}

/// Zufälliger Versatz in ±1..=FALLBACK_MAX_OFFSET_HZ, nie 0
fn random_offset() -> i32 {
    let mut rng = rand::thread_rng();
    let magnitude = rng.gen_range(1..=FALLBACK_MAX_OFFSET_HZ);
    if rng.gen_bool(0.5) {
        magnitude
    } else {
        -magnitude
    }
}

// ============================================================================
// TESTS
// ============================================================================
