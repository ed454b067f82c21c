//! Signaling-Stack Schnittstellen
//!
//! Der Call-Core behandelt den SIP/WebRTC Stack als externen Baustein.
//! Dieses Modul definiert die Fähigkeiten, die der Core davon braucht:
//! URIs bauen, Transport anlegen, Agent starten, registrieren, einladen
//! und beenden. Zustandsänderungen kommen geordnet über Broadcast-Kanäle.

use crate::media::{MediaStream, G711_SAMPLE_RATE};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalingError {
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Invitation failed: {0}")]
    InvitationFailed(String),

    #[error("Termination failed: {0}")]
    TerminationFailed(String),

    #[error("Media negotiation failed: {0}")]
    Negotiation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// SIP URI
// ============================================================================

/// Minimaler SIP URI: `sip:user@host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    /// Parst eine Adresse, `None` wenn sie kein gültiger SIP URI ist
    pub fn parse(address: &str) -> Option<Self> {
        let address = address.trim();
        let address = address
            .strip_prefix('<')
            .and_then(|a| a.strip_suffix('>'))
            .unwrap_or(address);

        let (secure, rest) = if let Some(rest) = address.strip_prefix("sips:") {
            (true, rest)
        } else if let Some(rest) = address.strip_prefix("sip:") {
            (false, rest)
        } else {
            return None;
        };

        // URI-Parameter und Header ignorieren
        let rest = rest.split([';', '?']).next().unwrap_or_default();
        if rest.is_empty() || rest.contains(char::is_whitespace) {
            return None;
        }

        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user.to_string()), host_port),
            Some(_) => return None,
            None => (None, rest),
        };

        let (host, port) = if let Some(v6) = host_port.strip_prefix('[') {
            let (host, tail) = v6.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse().ok()?),
                None if tail.is_empty() => None,
                None => return None,
            };
            (format!("[{}]", host), port)
        } else {
            match host_port.split_once(':') {
                Some((host, port)) => (host.to_string(), Some(port.parse().ok()?)),
                None => (host_port.to_string(), None),
            }
        };

        if host.is_empty() {
            return None;
        }

        Some(Self {
            secure,
            user,
            host,
            port,
        })
    }

    /// Host inklusive Port
    pub fn host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl std::fmt::Display for SipUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure { "sips" } else { "sip" };
        match &self.user {
            Some(user) => write!(f, "{}:{}@{}", scheme, user, self.host_port()),
            None => write!(f, "{}:{}", scheme, self.host_port()),
        }
    }
}

// ============================================================================
// TRANSPORT / OPTIONS
// ============================================================================

/// Transport-Beschreibung, an einen Signaling-Endpunkt gebunden
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    endpoint: Url,
}

impl Transport {
    /// Bindet einen Transport an einen ws:// oder wss:// Endpunkt
    pub fn new(endpoint: &str) -> Result<Self, SignalingError> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| SignalingError::Transport(e.to_string()))?;
        match endpoint.scheme() {
            "ws" | "wss" => Ok(Self { endpoint }),
            other => Err(SignalingError::Transport(format!(
                "unsupported transport scheme: {}",
                other
            ))),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Optionen beim Erstellen eines User Agents
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub transport: Transport,
    pub credentials: Credentials,
    pub display_name: String,
}

/// Optionen für die Registrierung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistererOptions {
    /// Gültigkeit der Registrierung in Sekunden
    pub expires: u32,
}

impl Default for RegistererOptions {
    fn default() -> Self {
        Self { expires: 600 }
    }
}

/// Medien-Optionen für eine Einladung
#[derive(Debug, Clone, PartialEq)]
pub struct MediaOptions {
    pub audio: bool,
    pub video: bool,
    /// Mikrofon, das auf den lokalen Audio-Track gesendet wird.
    /// Ohne Stream wird Stille gesendet.
    pub stream: Option<MediaStream>,
}

impl MediaOptions {
    /// Nur Audio, gespeist aus `stream`
    pub fn audio(stream: Option<MediaStream>) -> Self {
        Self {
            stream,
            ..Self::default()
        }
    }
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
            stream: None,
        }
    }
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// Zustandsmeldungen des User Agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentNotification {
    Started,
    Stopped,
}

/// Zustandsmeldungen des Registerers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistererState {
    Registering,
    Registered,
    Unregistered,
    Terminated,
}

/// Zustandsmeldungen einer Einladung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Establishing,
    Established,
    Terminated,
}

/// Events einer Einladung, in Emissionsreihenfolge
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    TrackAdded(RemoteTrack),
}

// ============================================================================
// REMOTE TRACK
// ============================================================================

/// Art eines empfangenen Tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown(String),
}

/// Ein vom Gegenüber empfangener Media-Track.
///
/// Die Payloads (z.B. RTP Nutzdaten) können genau einmal entnommen werden.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    /// MIME Type des Codecs, z.B. `audio/PCMU`
    pub codec: String,
    /// Takt des Codecs in Hz
    pub clock_rate: u32,
    payloads: Arc<Mutex<Option<mpsc::Receiver<Vec<u8>>>>>,
}

impl RemoteTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        codec: impl Into<String>,
        payloads: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            codec: codec.into(),
            clock_rate: G711_SAMPLE_RATE,
            payloads: Arc::new(Mutex::new(Some(payloads))),
        }
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    /// Echter Audio-Track, direkt abspielbar
    pub fn is_audio_track(&self) -> bool {
        self.kind == TrackKind::Audio
    }

    /// Entnimmt den Payload-Receiver
    pub fn take_payloads(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.payloads.lock().take()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("clock_rate", &self.clock_rate)
            .finish()
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Einstiegspunkt in den Signaling-Stack
pub trait SignalingStack: Send + Sync {
    /// Baut einen URI aus einer Adresse, `None` bei ungültiger Eingabe
    fn make_uri(&self, address: &str) -> Option<SipUri> {
        SipUri::parse(address)
    }

    /// Erstellt einen Transport für den Endpunkt
    fn create_transport(&self, endpoint: &str) -> Result<Transport, SignalingError> {
        Transport::new(endpoint)
    }

    /// Erstellt einen User Agent
    fn create_agent(
        &self,
        uri: SipUri,
        options: AgentOptions,
    ) -> Result<Arc<dyn UserAgent>, SignalingError>;
}

/// Live-Verbindung zum Signaling-Server
#[async_trait]
pub trait UserAgent: Send + Sync {
    fn uri(&self) -> &SipUri;

    fn subscribe(&self) -> broadcast::Receiver<AgentNotification>;

    async fn start(&self) -> Result<(), SignalingError>;

    async fn stop(&self);

    fn create_registerer(
        &self,
        options: RegistererOptions,
    ) -> Result<Arc<dyn Registerer>, SignalingError>;

    fn create_invitation(
        &self,
        target: SipUri,
        media: MediaOptions,
    ) -> Result<Arc<dyn Invitation>, SignalingError>;
}

#[async_trait]
pub trait Registerer: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<RegistererState>;

    async fn register(&self) -> Result<(), SignalingError>;

    async fn unregister(&self) -> Result<(), SignalingError>;
}

/// Ausgehende Einladung (eine Call-Verhandlung)
#[async_trait]
pub trait Invitation: Send + Sync {
    fn id(&self) -> &str;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    async fn invite(&self) -> Result<(), SignalingError>;

    async fn terminate(&self) -> Result<(), SignalingError>;
}

// ============================================================================
// TESTS
// ============================================================================
