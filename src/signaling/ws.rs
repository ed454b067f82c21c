//! SIP über WebSocket (RFC 7118)
//!
//! Konkreter Signaling-Stack für den Call-Core:
//! - WebSocket-Verbindung mit Subprotokoll `sip`, Read- und Write-Task
//! - REGISTER mit Digest-Authentifizierung
//! - INVITE mit SDP Offer aus einer WebRTC Peer Connection
//! - CANCEL/BYE zum Beenden, eingehendes BYE vom Gegenüber

use super::message::{addr_uri, param, DigestChallenge, Method, SipMessage, SipRequest, SipResponse};
use super::stack::*;
use crate::media::{AudioFrame, MediaStream, FRAME_SAMPLES, G711, G711_SAMPLE_RATE};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Timer F/B (64 * T1): Wartezeit auf eine finale Antwort
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

/// Wie lange ein INVITE klingeln darf
const INVITE_TIMEOUT: Duration = Duration::from_secs(180);

/// Obergrenze für das ICE Gathering vor dem Offer
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Dauer eines gesendeten Audio-Frames
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Codec des lokalen Tracks
const UPLINK_CODEC: G711 = G711::Pcmu;

/// Baut den WebSocket-Request mit Subprotokoll `sip`
pub fn sip_ws_request(endpoint: &str) -> Result<Request, SignalingError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| SignalingError::Transport(e.to_string()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));
    Ok(request)
}

// ============================================================================
// STACK
// ============================================================================

/// Signaling-Stack über SIP/WebSocket
#[derive(Debug, Clone)]
pub struct WsSignaling {
    ice_servers: Vec<String>,
    user_agent: String,
}

impl WsSignaling {
    pub fn new(ice_servers: Vec<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ice_servers,
            user_agent: user_agent.into(),
        }
    }
}

impl SignalingStack for WsSignaling {
    fn create_agent(
        &self,
        uri: SipUri,
        options: AgentOptions,
    ) -> Result<Arc<dyn UserAgent>, SignalingError> {
        if uri.user.is_none() {
            return Err(SignalingError::InvalidUri(format!(
                "agent URI needs a user part: {}",
                uri
            )));
        }

        let (event_tx, _) = broadcast::channel(32);
        let inner = Arc::new(AgentInner {
            contact_host: format!("{}.invalid", Uuid::new_v4().simple()),
            uri,
            options,
            ice_servers: self.ice_servers.clone(),
            user_agent: self.user_agent.clone(),
            tx: RwLock::new(None),
            transactions: Mutex::new(HashMap::new()),
            dialogs: Mutex::new(HashMap::new()),
            event_tx,
        });

        Ok(Arc::new(WsUserAgent {
            inner,
            reader: Mutex::new(None),
        }))
    }
}

// ============================================================================
// USER AGENT
// ============================================================================

struct AgentInner {
    uri: SipUri,
    options: AgentOptions,
    ice_servers: Vec<String>,
    user_agent: String,
    /// Zufälliger Host für Via/Contact (WebSocket-Clients haben keine Adresse)
    contact_host: String,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    /// Offene Client-Transaktionen: `branch:METHOD` → Antworten
    transactions: Mutex<HashMap<String, mpsc::UnboundedSender<SipResponse>>>,
    /// Bestehende Dialoge: Call-ID → eingehende Requests
    dialogs: Mutex<HashMap<String, mpsc::UnboundedSender<SipRequest>>>,
    event_tx: broadcast::Sender<AgentNotification>,
}

/// User Agent mit WebSocket-Transport
pub struct WsUserAgent {
    inner: Arc<AgentInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl UserAgent for WsUserAgent {
    fn uri(&self) -> &SipUri {
        &self.inner.uri
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentNotification> {
        self.inner.event_tx.subscribe()
    }

    async fn start(&self) -> Result<(), SignalingError> {
        let endpoint = self.inner.options.transport.endpoint().as_str().to_string();
        tracing::info!("Connecting to signaling server: {}", endpoint);

        let request = sip_ws_request(&endpoint)?;
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.inner.tx.write() = Some(tx);

        // Read-Task
        let inner = Arc::clone(&self.inner);
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => inner.handle_incoming(&text).await,
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            inner.disconnected();
        });
        *self.reader.lock() = Some(reader);

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let _ = self.inner.event_tx.send(AgentNotification::Started);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.inner.disconnected();
    }

    fn create_registerer(
        &self,
        options: RegistererOptions,
    ) -> Result<Arc<dyn Registerer>, SignalingError> {
        let (event_tx, _) = broadcast::channel(32);
        Ok(Arc::new(WsRegisterer {
            inner: Arc::clone(&self.inner),
            options,
            call_id: Uuid::new_v4().to_string(),
            from_tag: new_tag(),
            cseq: AtomicU32::new(0),
            event_tx,
        }))
    }

    fn create_invitation(
        &self,
        target: SipUri,
        media: MediaOptions,
    ) -> Result<Arc<dyn Invitation>, SignalingError> {
        if !media.audio {
            return Err(SignalingError::Negotiation("audio is required".into()));
        }
        let (event_tx, _) = broadcast::channel(32);
        Ok(Arc::new(WsInvitation {
            inner: Arc::clone(&self.inner),
            call_id: Uuid::new_v4().to_string(),
            from_tag: new_tag(),
            target,
            media,
            cseq: AtomicU32::new(0),
            peer_connection: Mutex::new(None),
            uplink: Mutex::new(None),
            pending_invite: Mutex::new(None),
            dialog: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            terminated: Arc::new(AtomicBool::new(false)),
            event_tx,
        }))
    }
}

impl AgentInner {
    fn is_connected(&self) -> bool {
        self.tx.read().is_some()
    }

    /// Verbindung weg: offene Transaktionen scheitern, Stopped wird gemeldet
    fn disconnected(&self) {
        let was_connected = self.tx.write().take().is_some();
        self.transactions.lock().clear();
        if was_connected {
            tracing::info!("Signaling connection closed");
            let _ = self.event_tx.send(AgentNotification::Stopped);
        }
    }

    async fn send(&self, text: String) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;
        tracing::debug!("SIP >>> {}", text.lines().next().unwrap_or_default());
        tx.send(text)
            .await
            .map_err(|_| SignalingError::NotConnected)
    }

    fn from_header(&self, tag: &str) -> String {
        format!(
            "\"{}\" <{}>;tag={}",
            self.options.display_name, self.uri, tag
        )
    }

    fn contact_header(&self) -> String {
        let user = self.uri.user.as_deref().unwrap_or_default();
        format!("<sip:{}@{};transport=ws>", user, self.contact_host)
    }

    /// Request mit den Standard-Headern und frischem Branch
    fn base_request(
        &self,
        method: Method,
        uri: &str,
        call_id: &str,
        from_tag: &str,
        to: &str,
        cseq: u32,
    ) -> SipRequest {
        let cseq_header = format!("{} {}", cseq, method);
        SipRequest::new(method, uri)
            .header(
                "Via",
                format!(
                    "SIP/2.0/WSS {};branch=z9hG4bK{}",
                    self.contact_host,
                    Uuid::new_v4().simple()
                ),
            )
            .header("Max-Forwards", "70")
            .header("From", self.from_header(from_tag))
            .header("To", to)
            .header("Call-ID", call_id)
            .header("CSeq", cseq_header)
            .header("Contact", self.contact_header())
            .header("User-Agent", self.user_agent.clone())
    }

    /// Sendet einen Request und wartet auf die finale Antwort
    async fn transact(
        &self,
        request: SipRequest,
        timeout: Duration,
    ) -> Result<SipResponse, SignalingError> {
        let key = transaction_key(&request)
            .ok_or_else(|| SignalingError::Protocol("request without branch".into()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.transactions.lock().insert(key.clone(), tx);

        let result = async {
            self.send(request.to_string()).await?;
            let wait = async {
                while let Some(response) = rx.recv().await {
                    if !response.is_provisional() {
                        return Ok(response);
                    }
                    tracing::debug!("Provisional {} {}", response.status, response.reason);
                }
                Err(SignalingError::NotConnected)
            };
            tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| SignalingError::Timeout(format!("no final response to {}", request.method)))?
        }
        .await;

        self.transactions.lock().remove(&key);

        let response = result?;
        if request.method == Method::Invite && response.status >= 300 {
            self.ack_failure(&request, &response).await;
        }
        Ok(response)
    }

    /// Wie `transact`, beantwortet aber eine Digest-Challenge einmal
    async fn transact_with_auth<F>(
        &self,
        mut build: F,
        timeout: Duration,
    ) -> Result<SipResponse, SignalingError>
    where
        F: FnMut(Option<(&'static str, String)>) -> SipRequest + Send,
    {
        let request = build(None);
        let response = self.transact(request.clone(), timeout).await?;
        if !response.is_auth_challenge() {
            return Ok(response);
        }

        let (challenge_name, auth_name) = if response.status == 407 {
            ("Proxy-Authenticate", "Proxy-Authorization")
        } else {
            ("WWW-Authenticate", "Authorization")
        };
        let challenge = response
            .headers
            .get(challenge_name)
            .and_then(DigestChallenge::parse)
            .ok_or_else(|| SignalingError::Protocol("missing digest challenge".into()))?;

        tracing::debug!("Answering digest challenge for realm {}", challenge.realm);
        let credentials = &self.options.credentials;
        let value = challenge.authorization(
            &request.method,
            &request.uri,
            &credentials.username,
            &credentials.password,
            &Uuid::new_v4().simple().to_string()[..16],
        );

        self.transact(build(Some((auth_name, value))), timeout).await
    }

    /// ACK für eine negative INVITE-Antwort (gleicher Branch)
    async fn ack_failure(&self, invite: &SipRequest, response: &SipResponse) {
        let cseq = invite
            .headers
            .get("CSeq")
            .and_then(|c| c.split_whitespace().next())
            .unwrap_or("1");
        let mut ack = SipRequest::new(Method::Ack, invite.uri.clone());
        for name in ["Via", "From", "Call-ID"] {
            if let Some(value) = invite.headers.get(name) {
                ack.headers.push(name, value);
            }
        }
        if let Some(to) = response.headers.get("To") {
            ack.headers.push("To", to);
        }
        ack.headers.push("CSeq", format!("{} ACK", cseq));
        ack.headers.push("Max-Forwards", "70");

        if let Err(e) = self.send(ack.to_string()).await {
            tracing::debug!("Failed to ACK {}: {}", response.status, e);
        }
    }

    async fn handle_incoming(&self, text: &str) {
        let msg = match SipMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping unparseable SIP message: {}", e);
                return;
            }
        };

        match msg {
            SipMessage::Response(response) => {
                tracing::debug!("SIP <<< {} {}", response.status, response.reason);
                let key = response_key(&response);
                let tx = key.and_then(|k| self.transactions.lock().get(&k).cloned());
                match tx {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!("Response without transaction: {}", response.status),
                }
            }
            SipMessage::Request(request) => {
                tracing::debug!("SIP <<< {} {}", request.method, request.uri);
                self.handle_request(request).await;
            }
        }
    }

    async fn handle_request(&self, request: SipRequest) {
        let call_id = request.headers.get("Call-ID").unwrap_or_default().to_string();
        let reply = match request.method {
            Method::Bye => {
                let dialog = self.dialogs.lock().remove(&call_id);
                match dialog {
                    Some(dialog) => {
                        let _ = dialog.send(request.clone());
                        request.response(200, "OK")
                    }
                    None => request.response(481, "Call/Transaction Does Not Exist"),
                }
            }
            Method::Options => request.response(200, "OK"),
            // Eingehende Anrufe werden nicht angenommen
            Method::Invite => request.response(486, "Busy Here"),
            Method::Ack => return,
            _ => request.response(501, "Not Implemented"),
        };

        if let Err(e) = self.send(reply.to_string()).await {
            tracing::warn!("Failed to reply to {}: {}", request.method, e);
        }
    }
}

fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

fn transaction_key(request: &SipRequest) -> Option<String> {
    let branch = request.headers.get("Via").and_then(|v| param(v, "branch"))?;
    Some(format!("{}:{}", branch, request.method))
}

fn response_key(response: &SipResponse) -> Option<String> {
    let branch = response.headers.get("Via").and_then(|v| param(v, "branch"))?;
    let method = response.headers.get("CSeq")?.split_whitespace().nth(1)?;
    Some(format!("{}:{}", branch, method))
}

impl std::fmt::Debug for WsUserAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsUserAgent")
            .field("uri", &self.inner.uri.to_string())
            .field("connected", &self.inner.is_connected())
            .finish()
    }
}

// ============================================================================
// REGISTERER
// ============================================================================

struct WsRegisterer {
    inner: Arc<AgentInner>,
    options: RegistererOptions,
    call_id: String,
    from_tag: String,
    cseq: AtomicU32,
    event_tx: broadcast::Sender<RegistererState>,
}

impl WsRegisterer {
    async fn send_register(&self, expires: u32) -> Result<SipResponse, SignalingError> {
        let registrar = format!("sip:{}", self.inner.uri.host_port());
        let to = format!("<{}>", self.inner.uri);

        self.inner
            .transact_with_auth(
                |auth| {
                    let cseq = self.cseq.fetch_add(1, Ordering::SeqCst) + 1;
                    let mut request = self
                        .inner
                        .base_request(
                            Method::Register,
                            &registrar,
                            &self.call_id,
                            &self.from_tag,
                            &to,
                            cseq,
                        )
                        .header("Expires", expires.to_string());
                    if let Some((name, value)) = auth {
                        request = request.header(name, value);
                    }
                    request
                },
                TRANSACTION_TIMEOUT,
            )
            .await
    }
}

#[async_trait]
impl Registerer for WsRegisterer {
    fn subscribe(&self) -> broadcast::Receiver<RegistererState> {
        self.event_tx.subscribe()
    }

    async fn register(&self) -> Result<(), SignalingError> {
        let _ = self.event_tx.send(RegistererState::Registering);

        match self.send_register(self.options.expires).await {
            Ok(response) if response.is_success() => {
                let _ = self.event_tx.send(RegistererState::Registered);
                Ok(())
            }
            Ok(response) => {
                let _ = self.event_tx.send(RegistererState::Unregistered);
                Err(SignalingError::RegistrationFailed(format!(
                    "{} {}",
                    response.status, response.reason
                )))
            }
            Err(e) => {
                let _ = self.event_tx.send(RegistererState::Unregistered);
                Err(SignalingError::RegistrationFailed(e.to_string()))
            }
        }
    }

    async fn unregister(&self) -> Result<(), SignalingError> {
        let result = match self.send_register(0).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(SignalingError::RegistrationFailed(format!(
                "{} {}",
                response.status, response.reason
            ))),
            Err(e) => Err(e),
        };
        let _ = self.event_tx.send(RegistererState::Unregistered);
        let _ = self.event_tx.send(RegistererState::Terminated);
        result
    }
}

// ============================================================================
// INVITATION
// ============================================================================

fn g711_capability(codec: G711) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: G711_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

/// Daten eines bestätigten Dialogs
#[derive(Debug, Clone)]
struct Dialog {
    remote_target: String,
    to: String,
}

struct WsInvitation {
    inner: Arc<AgentInner>,
    call_id: String,
    from_tag: String,
    target: SipUri,
    media: MediaOptions,
    cseq: AtomicU32,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    /// Task, der das Mikrofon in den lokalen Track schreibt
    uplink: Mutex<Option<JoinHandle<()>>>,
    /// Zuletzt gesendetes INVITE (für CANCEL)
    pending_invite: Mutex<Option<SipRequest>>,
    dialog: Mutex<Option<Dialog>>,
    cancelled: AtomicBool,
    terminated: Arc<AtomicBool>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl WsInvitation {
    fn emit_state(&self, state: SessionState) {
        let _ = self.event_tx.send(SessionEvent::StateChanged(state));
    }

    /// Meldet Terminated genau einmal
    fn emit_terminated(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.emit_state(SessionState::Terminated);
        }
    }

    fn close_peer_connection(&self) {
        if let Some(uplink) = self.uplink.lock().take() {
            uplink.abort();
        }
        if let Some(pc) = self.peer_connection.lock().take() {
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
        }
    }

    /// Erstellt die Peer Connection und das SDP Offer
    async fn create_offer(&self) -> Result<String, SignalingError> {
        // Nur G.711, passend zur direkten Wiedergabe
        let mut media_engine = MediaEngine::default();
        for codec in [G711::Pcmu, G711::Pcma] {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: g711_capability(codec),
                        payload_type: codec.payload_type(),
                        ..Default::default()
                    },
                    RTPCodecType::Audio,
                )
                .map_err(|e| SignalingError::Negotiation(e.to_string()))?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SignalingError::Negotiation(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.inner.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.inner.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| SignalingError::Negotiation(e.to_string()))?,
        );
        self.setup_handlers(&pc);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            g711_capability(UPLINK_CODEC),
            "audio".to_string(),
            "softphone".to_string(),
        ));
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SignalingError::Negotiation(e.to_string()))?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| SignalingError::Negotiation(e.to_string()))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| SignalingError::Negotiation(e.to_string()))?;
        if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
            .await
            .is_err()
        {
            tracing::warn!("ICE gathering incomplete after {:?}", ICE_GATHER_TIMEOUT);
        }

        let sdp = pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| SignalingError::Negotiation("no local description".into()))?;

        *self.peer_connection.lock() = Some(pc);
        let uplink = self.spawn_uplink(audio_track);
        if let Some(previous) = self.uplink.lock().replace(uplink) {
            previous.abort();
        }
        Ok(sdp)
    }

    /// Schreibt Mikrofon-Frames als PCMU in den lokalen Track.
    ///
    /// Ohne Mikrofon wird im gleichen Takt Stille gesendet.
    fn spawn_uplink(&self, track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
        let stream = self.media.stream.clone();
        let terminated = Arc::clone(&self.terminated);
        tokio::spawn(async move {
            match &stream {
                Some(stream) => tracing::debug!("Sending microphone {}", stream.label()),
                None => tracing::debug!("No microphone, sending silence"),
            }
            let mut frames = stream.as_ref().map(MediaStream::subscribe_frames);
            let silence: AudioFrame = Arc::from(vec![0.0f32; FRAME_SAMPLES]);
            let mut ticker = tokio::time::interval(FRAME_DURATION);

            while !terminated.load(Ordering::SeqCst) {
                let frame = match frames.as_mut() {
                    Some(rx) => match rx.recv().await {
                        Ok(frame) => frame,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!("Uplink skipped {} frames", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    None => {
                        ticker.tick().await;
                        Arc::clone(&silence)
                    }
                };

                let sample = Sample {
                    data: Bytes::from(UPLINK_CODEC.encode(&frame)),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    tracing::warn!("Failed to write audio sample: {}", e);
                    break;
                }
            }
        })
    }

    fn setup_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            Box::pin(async {})
        }));

        // Eingehende Tracks als RemoteTrack weiterreichen
        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let event_tx = event_tx.clone();
            Box::pin(async move {
                let codec = track.codec().capability.mime_type;
                tracing::info!("Received remote track {} ({})", track.id(), codec);

                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    other => TrackKind::Unknown(other.to_string()),
                };
                let (payload_tx, payload_rx) = mpsc::channel(64);
                let clock_rate = track.codec().capability.clock_rate;
                let remote = RemoteTrack::new(track.id(), kind, codec, payload_rx)
                    .with_clock_rate(clock_rate);
                let _ = event_tx.send(SessionEvent::TrackAdded(remote));

                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        if payload_tx.send(packet.payload.to_vec()).await.is_err() {
                            break;
                        }
                    }
                });
            })
        }));
    }

    fn build_invite(&self, sdp: &str, auth: Option<(&'static str, String)>) -> SipRequest {
        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.target.to_string();
        let mut request = self
            .inner
            .base_request(
                Method::Invite,
                &target,
                &self.call_id,
                &self.from_tag,
                &format!("<{}>", target),
                cseq,
            )
            .with_body("application/sdp", sdp.to_string());
        if let Some((name, value)) = auth {
            request = request.header(name, value);
        }
        *self.pending_invite.lock() = Some(request.clone());
        request
    }

    /// In-Dialog Request (ACK/BYE)
    fn dialog_request(&self, method: Method, dialog: &Dialog, cseq: u32) -> SipRequest {
        self.inner.base_request(
            method,
            &dialog.remote_target,
            &self.call_id,
            &self.from_tag,
            &dialog.to,
            cseq,
        )
    }

    /// Bestätigt ein 2xx und überwacht den Dialog auf BYE
    async fn confirm(&self, response: &SipResponse) -> Result<Dialog, SignalingError> {
        let to = response
            .headers
            .get("To")
            .ok_or_else(|| SignalingError::Protocol("2xx without To".into()))?
            .to_string();
        let remote_target = response
            .headers
            .get("Contact")
            .map(|c| addr_uri(c).to_string())
            .unwrap_or_else(|| self.target.to_string());
        let dialog = Dialog { remote_target, to };

        let cseq = self.cseq.load(Ordering::SeqCst);
        let ack = self.dialog_request(Method::Ack, &dialog, cseq);
        self.inner.send(ack.to_string()).await?;

        let (bye_tx, mut bye_rx) = mpsc::unbounded_channel();
        self.inner
            .dialogs
            .lock()
            .insert(self.call_id.clone(), bye_tx);

        let event_tx = self.event_tx.clone();
        let terminated = Arc::clone(&self.terminated);
        let pc = self.peer_connection.lock().clone();
        tokio::spawn(async move {
            if bye_rx.recv().await.is_some() {
                tracing::info!("Remote party ended the call");
                if let Some(pc) = pc {
                    let _ = pc.close().await;
                }
                if !terminated.swap(true, Ordering::SeqCst) {
                    let _ = event_tx.send(SessionEvent::StateChanged(SessionState::Terminated));
                }
            }
        });

        Ok(dialog)
    }

    async fn send_bye(&self, dialog: &Dialog) -> Result<(), SignalingError> {
        self.inner.dialogs.lock().remove(&self.call_id);
        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let bye = self.dialog_request(Method::Bye, dialog, cseq);
        let response = self.inner.transact(bye, TRANSACTION_TIMEOUT).await?;
        if response.is_success() || response.status == 481 {
            Ok(())
        } else {
            Err(SignalingError::TerminationFailed(format!(
                "{} {}",
                response.status, response.reason
            )))
        }
    }
}

#[async_trait]
impl Invitation for WsInvitation {
    fn id(&self) -> &str {
        &self.call_id
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    async fn invite(&self) -> Result<(), SignalingError> {
        if !self.inner.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        self.emit_state(SessionState::Establishing);

        let sdp = match self.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.close_peer_connection();
                return Err(e);
            }
        };

        let response = match self
            .inner
            .transact_with_auth(|auth| self.build_invite(&sdp, auth), INVITE_TIMEOUT)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.close_peer_connection();
                return Err(SignalingError::InvitationFailed(e.to_string()));
            }
        };
        self.pending_invite.lock().take();

        if !response.is_success() {
            self.close_peer_connection();
            return Err(SignalingError::InvitationFailed(format!(
                "{} {}",
                response.status, response.reason
            )));
        }

        let dialog = self.confirm(&response).await?;

        // CANCEL kam zu spät, der Call wurde trotzdem angenommen
        if self.cancelled.load(Ordering::SeqCst) {
            let _ = self.send_bye(&dialog).await;
            self.close_peer_connection();
            self.emit_terminated();
            return Ok(());
        }
        *self.dialog.lock() = Some(dialog.clone());

        let answer = RTCSessionDescription::answer(response.body.clone())
            .map_err(|e| SignalingError::Negotiation(e.to_string()));
        let pc = self.peer_connection.lock().clone();
        let applied = match (answer, pc) {
            (Ok(answer), Some(pc)) => pc
                .set_remote_description(answer)
                .await
                .map_err(|e| SignalingError::Negotiation(e.to_string())),
            (Err(e), _) => Err(e),
            (_, None) => Err(SignalingError::Negotiation("peer connection closed".into())),
        };
        if let Err(e) = applied {
            tracing::error!("Failed to apply SDP answer: {}", e);
            self.dialog.lock().take();
            let _ = self.send_bye(&dialog).await;
            self.close_peer_connection();
            return Err(e);
        }

        self.emit_state(SessionState::Established);
        Ok(())
    }

    async fn terminate(&self) -> Result<(), SignalingError> {
        let dialog = self.dialog.lock().take();
        let pending = self.pending_invite.lock().take();

        let result = if let Some(dialog) = dialog {
            self.send_bye(&dialog).await
        } else if let Some(invite) = pending {
            self.cancelled.store(true, Ordering::SeqCst);
            let mut cancel = SipRequest::new(Method::Cancel, invite.uri.clone());
            for name in ["Via", "From", "To", "Call-ID"] {
                if let Some(value) = invite.headers.get(name) {
                    cancel.headers.push(name, value);
                }
            }
            let cseq = invite
                .headers
                .get("CSeq")
                .and_then(|c| c.split_whitespace().next())
                .unwrap_or("1");
            cancel.headers.push("CSeq", format!("{} CANCEL", cseq));
            cancel.headers.push("Max-Forwards", "70");
            self.inner.send(cancel.to_string()).await
        } else {
            Ok(())
        };

        self.close_peer_connection();
        self.emit_terminated();
        result.map_err(|e| SignalingError::TerminationFailed(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request as ServerRequest, Response};
    use tokio_tungstenite::WebSocketStream;

    type ServerStream = WebSocketStream<tokio::net::TcpStream>;

    /// Startet einen WebSocket-Server, der das `sip` Subprotokoll bestätigt
    async fn sip_server() -> (String, tokio::sync::oneshot::Receiver<ServerStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(
                stream,
                |_req: &ServerRequest, mut resp: Response| {
                    resp.headers_mut()
                        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            let _ = tx.send(ws);
        });
        (format!("ws://{}", addr), rx)
    }

    async fn next_request(ws: &mut ServerStream) -> SipRequest {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => match SipMessage::parse(&text).unwrap() {
                    SipMessage::Request(req) => return req,
                    SipMessage::Response(_) => continue,
                },
                _ => continue,
            }
        }
    }

    fn agent(endpoint: &str) -> Arc<dyn UserAgent> {
        let stack = WsSignaling::new(Vec::new(), "test-agent");
        let options = AgentOptions {
            transport: stack.create_transport(endpoint).unwrap(),
            credentials: Credentials {
                username: "alice".into(),
                password: "secret".into(),
            },
            display_name: "Alice".into(),
        };
        let uri = stack.make_uri("sip:alice@example.com").unwrap();
        stack.create_agent(uri, options).unwrap()
    }

    #[tokio::test]
    async fn test_register_answers_digest_challenge() {
        let (endpoint, server) = sip_server().await;
        let agent = agent(&endpoint);
        let mut notifications = agent.subscribe();
        agent.start().await.unwrap();
        assert_eq!(notifications.recv().await.unwrap(), AgentNotification::Started);

        let registerer = agent.create_registerer(RegistererOptions::default()).unwrap();
        let mut states = registerer.subscribe();

        let server_task = tokio::spawn(async move {
            let mut ws = server.await.unwrap();

            let first = next_request(&mut ws).await;
            assert_eq!(first.method, Method::Register);
            assert!(first.headers.get("Authorization").is_none());
            let mut challenge = first.response(401, "Unauthorized");
            challenge.headers.push(
                "WWW-Authenticate",
                "Digest realm=\"example.com\", nonce=\"abc123\"",
            );
            ws.send(Message::Text(challenge.to_string())).await.unwrap();

            let second = next_request(&mut ws).await;
            let auth = second.headers.get("Authorization").unwrap().to_string();
            assert!(auth.contains("username=\"alice\""));
            assert!(auth.contains("nonce=\"abc123\""));
            assert_eq!(second.headers.get("CSeq"), Some("2 REGISTER"));
            ws.send(Message::Text(second.response(200, "OK").to_string()))
                .await
                .unwrap();
            ws
        });

        registerer.register().await.unwrap();
        assert_eq!(states.recv().await.unwrap(), RegistererState::Registering);
        assert_eq!(states.recv().await.unwrap(), RegistererState::Registered);

        let _ws = server_task.await.unwrap();
        agent.stop().await;
        assert_eq!(notifications.recv().await.unwrap(), AgentNotification::Stopped);
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let (endpoint, server) = sip_server().await;
        let agent = agent(&endpoint);
        agent.start().await.unwrap();
        let registerer = agent.create_registerer(RegistererOptions::default()).unwrap();
        let mut states = registerer.subscribe();

        tokio::spawn(async move {
            let mut ws = server.await.unwrap();
            let req = next_request(&mut ws).await;
            ws.send(Message::Text(req.response(403, "Forbidden").to_string()))
                .await
                .unwrap();
            // Verbindung offen halten
            let _ = ws.next().await;
        });

        let err = registerer.register().await.unwrap_err();
        assert_eq!(
            err,
            SignalingError::RegistrationFailed("403 Forbidden".into())
        );
        assert_eq!(states.recv().await.unwrap(), RegistererState::Registering);
        assert_eq!(states.recv().await.unwrap(), RegistererState::Unregistered);
    }

    #[tokio::test]
    async fn test_invite_rejected_is_acked_and_fails() {
        let (endpoint, server) = sip_server().await;
        let agent = agent(&endpoint);
        agent.start().await.unwrap();

        let target = SipUri::parse("sip:1000@example.com").unwrap();
        let invitation = agent
            .create_invitation(target, MediaOptions::default())
            .unwrap();

        let server_task = tokio::spawn(async move {
            let mut ws = server.await.unwrap();
            let invite = next_request(&mut ws).await;
            assert_eq!(invite.method, Method::Invite);
            assert!(invite.body.starts_with("v=0"));
            ws.send(Message::Text(invite.response(486, "Busy Here").to_string()))
                .await
                .unwrap();
            let ack = next_request(&mut ws).await;
            assert_eq!(ack.method, Method::Ack);
            assert_eq!(ack.headers.get("Via"), invite.headers.get("Via"));
        });

        let err = invitation.invite().await.unwrap_err();
        assert!(matches!(err, SignalingError::InvitationFailed(ref m) if m.contains("486")));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invite_without_connection_fails() {
        let agent = agent("ws://127.0.0.1:9");
        let target = SipUri::parse("sip:1000@example.com").unwrap();
        let invitation = agent
            .create_invitation(target, MediaOptions::default())
            .unwrap();
        assert_eq!(invitation.invite().await, Err(SignalingError::NotConnected));
        // Terminate ohne INVITE ist ein No-op
        assert!(invitation.terminate().await.is_ok());
    }

    #[test]
    fn test_agent_requires_user_part() {
        let stack = WsSignaling::new(Vec::new(), "test-agent");
        let options = AgentOptions {
            transport: Transport::new("ws://localhost:5066").unwrap(),
            credentials: Credentials {
                username: "alice".into(),
                password: String::new(),
            },
            display_name: String::new(),
        };
        let uri = SipUri::parse("sip:example.com").unwrap();
        assert!(matches!(
            stack.create_agent(uri, options),
            Err(SignalingError::InvalidUri(_))
        ));
    }
}
