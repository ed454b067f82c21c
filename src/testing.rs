//! Skriptbare Fakes für alle Kollaborateure (nur in Tests)

use crate::media::{
    AudioCapture, MediaError, MediaStream, PlaybackError, PlaybackSink, ToneHandle, ToneSynth,
};
use crate::signaling::*;
use crate::status::StatusSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingStatus {
    lines: Mutex<Vec<String>>,
}

impl RecordingStatus {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lines.lock().iter().any(|l| l == text)
    }
}

impl StatusSink for RecordingStatus {
    fn report_status(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}

// ============================================================================
// PROBE
// ============================================================================

#[derive(Debug)]
pub struct FakeProbe {
    reachable: bool,
    calls: AtomicUsize,
    last_timeout: Mutex<Option<Duration>>,
}

impl FakeProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable,
            calls: AtomicUsize::new(0),
            last_timeout: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        *self.last_timeout.lock()
    }
}

#[async_trait]
impl ConnectivityProbe for FakeProbe {
    async fn probe(&self, _endpoint: &str, timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_timeout.lock() = Some(timeout);
        self.reachable
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteBehavior {
    Accept,
    Reject,
    /// Bleibt offen, bis `terminate` aufgerufen wird
    Pending,
}

pub struct FakeStack {
    pub agent: Arc<FakeAgent>,
    fail_create: bool,
    created: AtomicUsize,
}

impl FakeStack {
    pub fn new(agent: Arc<FakeAgent>) -> Self {
        Self {
            agent,
            fail_create: false,
            created: AtomicUsize::new(0),
        }
    }

    pub fn failing_create(agent: Arc<FakeAgent>) -> Self {
        Self {
            fail_create: true,
            ..Self::new(agent)
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SignalingStack for FakeStack {
    fn create_agent(
        &self,
        _uri: SipUri,
        _options: AgentOptions,
    ) -> Result<Arc<dyn UserAgent>, SignalingError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(SignalingError::InvalidUri("scripted failure".into()));
        }
        Ok(self.agent.clone())
    }
}

pub struct FakeAgent {
    uri: SipUri,
    start: StartBehavior,
    starts: AtomicUsize,
    stops: AtomicUsize,
    notifications: broadcast::Sender<AgentNotification>,
    pub registerer: Arc<FakeRegisterer>,
    invite: Mutex<InviteBehavior>,
    terminate_fails: AtomicBool,
    invitations: Mutex<Vec<Arc<FakeInvitation>>>,
}

impl FakeAgent {
    pub fn new(start: StartBehavior) -> Self {
        let (notifications, _) = broadcast::channel(16);
        Self {
            uri: SipUri::parse("sip:alice@example.com").unwrap(),
            start,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            notifications,
            registerer: Arc::new(FakeRegisterer::new(true)),
            invite: Mutex::new(InviteBehavior::Accept),
            terminate_fails: AtomicBool::new(false),
            invitations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_registerer(mut self, registerer: FakeRegisterer) -> Self {
        self.registerer = Arc::new(registerer);
        self
    }

    pub fn set_invite(&self, behavior: InviteBehavior) {
        *self.invite.lock() = behavior;
    }

    pub fn set_terminate_fails(&self, fails: bool) {
        self.terminate_fails.store(fails, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn invitations(&self) -> Vec<Arc<FakeInvitation>> {
        self.invitations.lock().clone()
    }

    pub fn last_invitation(&self) -> Option<Arc<FakeInvitation>> {
        self.invitations.lock().last().cloned()
    }
}

#[async_trait]
impl UserAgent for FakeAgent {
    fn uri(&self) -> &SipUri {
        &self.uri
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentNotification> {
        self.notifications.subscribe()
    }

    async fn start(&self) -> Result<(), SignalingError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        match self.start {
            StartBehavior::Succeed => {
                let _ = self.notifications.send(AgentNotification::Started);
                Ok(())
            }
            StartBehavior::Fail => Err(SignalingError::ConnectionFailed("refused".into())),
            StartBehavior::Hang => std::future::pending().await,
        }
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let _ = self.notifications.send(AgentNotification::Stopped);
    }

    fn create_registerer(
        &self,
        _options: RegistererOptions,
    ) -> Result<Arc<dyn Registerer>, SignalingError> {
        Ok(self.registerer.clone())
    }

    fn create_invitation(
        &self,
        target: SipUri,
        media: MediaOptions,
    ) -> Result<Arc<dyn Invitation>, SignalingError> {
        let invitation = Arc::new(FakeInvitation::new(
            target,
            media,
            *self.invite.lock(),
            self.terminate_fails.load(Ordering::SeqCst),
        ));
        self.invitations.lock().push(invitation.clone());
        Ok(invitation)
    }
}

pub struct FakeRegisterer {
    succeed: bool,
    calls: AtomicUsize,
    events: broadcast::Sender<RegistererState>,
}

impl FakeRegisterer {
    pub fn new(succeed: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            succeed,
            calls: AtomicUsize::new(0),
            events,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registerer for FakeRegisterer {
    fn subscribe(&self) -> broadcast::Receiver<RegistererState> {
        self.events.subscribe()
    }

    async fn register(&self) -> Result<(), SignalingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(RegistererState::Registering);
        if self.succeed {
            let _ = self.events.send(RegistererState::Registered);
            Ok(())
        } else {
            let _ = self.events.send(RegistererState::Unregistered);
            Err(SignalingError::RegistrationFailed("403 Forbidden".into()))
        }
    }

    async fn unregister(&self) -> Result<(), SignalingError> {
        let _ = self.events.send(RegistererState::Unregistered);
        let _ = self.events.send(RegistererState::Terminated);
        Ok(())
    }
}

pub struct FakeInvitation {
    pub target: SipUri,
    media: MediaOptions,
    behavior: InviteBehavior,
    terminate_fails: bool,
    terminates: AtomicUsize,
    terminated: Notify,
    events: broadcast::Sender<SessionEvent>,
}

impl FakeInvitation {
    fn new(
        target: SipUri,
        media: MediaOptions,
        behavior: InviteBehavior,
        terminate_fails: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            target,
            media,
            behavior,
            terminate_fails,
            terminates: AtomicUsize::new(0),
            terminated: Notify::new(),
            events,
        }
    }

    /// Optionen, mit denen die Invitation angelegt wurde
    pub fn media(&self) -> MediaOptions {
        self.media.clone()
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    /// Liefert einen Remote-Track; der Sender füttert die Payloads
    pub fn add_track(&self, kind: TrackKind) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel(8);
        let track = RemoteTrack::new("remote-audio", kind, "audio/PCMU", rx);
        let _ = self.events.send(SessionEvent::TrackAdded(track));
        tx
    }

    /// Gegenüber legt auf
    pub fn remote_hangup(&self) {
        let _ = self
            .events
            .send(SessionEvent::StateChanged(SessionState::Terminated));
    }
}

#[async_trait]
impl Invitation for FakeInvitation {
    fn id(&self) -> &str {
        "fake-call"
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn invite(&self) -> Result<(), SignalingError> {
        let _ = self
            .events
            .send(SessionEvent::StateChanged(SessionState::Establishing));
        match self.behavior {
            InviteBehavior::Accept => {
                let _ = self
                    .events
                    .send(SessionEvent::StateChanged(SessionState::Established));
                Ok(())
            }
            InviteBehavior::Reject => Err(SignalingError::InvitationFailed(
                "488 Not Acceptable Here".into(),
            )),
            InviteBehavior::Pending => {
                self.terminated.notified().await;
                Err(SignalingError::InvitationFailed(
                    "487 Request Terminated".into(),
                ))
            }
        }
    }

    async fn terminate(&self) -> Result<(), SignalingError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        if self.terminate_fails {
            return Err(SignalingError::TerminationFailed("transport gone".into()));
        }
        self.terminated.notify_one();
        let _ = self
            .events
            .send(SessionEvent::StateChanged(SessionState::Terminated));
        Ok(())
    }
}

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Debug)]
pub struct FakeCapture {
    grant: AtomicBool,
    prompts: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeCapture {
    pub fn granting() -> Self {
        Self {
            grant: AtomicBool::new(true),
            prompts: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: AtomicBool::new(false),
            ..Self::granting()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_grant(&self, grant: bool) {
        self.grant.store(grant, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioCapture for FakeCapture {
    async fn acquire_audio(&self) -> Result<MediaStream, MediaError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.grant.load(Ordering::SeqCst) {
            Ok(MediaStream::new("fake microphone"))
        } else {
            Err(MediaError::PermissionDenied("user dismissed prompt".into()))
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeTone {
    tones: Mutex<Vec<Arc<FakeToneHandle>>>,
}

impl FakeTone {
    pub fn tones(&self) -> Vec<Arc<FakeToneHandle>> {
        self.tones.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeToneHandle>> {
        self.tones.lock().last().cloned()
    }
}

impl ToneSynth for FakeTone {
    fn create_tone(&self, frequency: f32, gain: f32) -> Result<Arc<dyn ToneHandle>, MediaError> {
        let handle = Arc::new(FakeToneHandle {
            gain,
            history: Mutex::new(vec![frequency]),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.tones.lock().push(handle.clone());
        Ok(handle)
    }
}

#[derive(Debug)]
pub struct FakeToneHandle {
    pub gain: f32,
    history: Mutex<Vec<f32>>,
    started: AtomicBool,
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl FakeToneHandle {
    /// Alle gesetzten Frequenzen, beginnend mit der Startfrequenz
    pub fn history(&self) -> Vec<f32> {
        self.history.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ToneHandle for FakeToneHandle {
    fn start(&self) -> Result<(), MediaError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_frequency(&self, frequency: f32) {
        self.history.lock().push(frequency);
    }

    fn frequency(&self) -> f32 {
        self.history.lock().last().copied().unwrap_or_default()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Eine aufgezeichnete Wiedergabe: Track-ID und ob verarbeitet
pub type Played = (String, bool);

#[derive(Debug, Default)]
pub struct FakeSink {
    block: AtomicBool,
    played: Mutex<Vec<Played>>,
    detaches: AtomicUsize,
}

impl FakeSink {
    pub fn blocking() -> Self {
        Self {
            block: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn set_block(&self, block: bool) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub fn played(&self) -> Vec<Played> {
        self.played.lock().clone()
    }

    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    fn attach(&self, track: RemoteTrack, processed: bool) -> Result<(), PlaybackError> {
        if self.block.load(Ordering::SeqCst) {
            return Err(PlaybackError::Blocked {
                track,
                reason: "autoplay not allowed".into(),
            });
        }
        self.played.lock().push((track.id.clone(), processed));
        Ok(())
    }
}

impl PlaybackSink for FakeSink {
    fn play(&self, track: RemoteTrack) -> Result<(), PlaybackError> {
        self.attach(track, false)
    }

    fn play_processed(&self, track: RemoteTrack) -> Result<(), PlaybackError> {
        self.attach(track, true)
    }

    fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}
