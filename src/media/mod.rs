//! Media Module - Mikrofon, Testton und Wiedergabe
//!
//! Dieses Modul verwaltet:
//! - Den Media Acquirer (Mikrofon einmal anfordern und cachen)
//! - Schnittstellen für Capture, Tonerzeugung und Wiedergabe
//! - cpal-basierte Implementierungen (`audio`)
//! - G.711 für gesendete und empfangene Payloads (`g711`)

mod audio;
mod g711;

pub use audio::{CpalCapture, CpalPlayback, CpalTone};
pub use g711::{G711, G711_SAMPLE_RATE};

use crate::signaling::RemoteTrack;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device error: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
pub enum PlaybackError {
    /// Wiedergabe konnte nicht starten, der Track kann später erneut
    /// abgespielt werden
    #[error("Audio playback blocked: {reason}")]
    Blocked { track: RemoteTrack, reason: String },

    #[error("Audio output unavailable: {0}")]
    Device(String),
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

/// Mono Samples eines Frames (8 kHz)
pub type AudioFrame = Arc<[f32]>;

/// Samples pro Frame: 20 ms bei 8 kHz
pub const FRAME_SAMPLES: usize = 160;

/// Frames, die ein langsamer Abnehmer zurückliegen darf
const FRAME_BACKLOG: usize = 50;

/// Handle auf das lokale Mikrofon.
///
/// Klone teilen dieselbe Aufnahme; sie endet, wenn der letzte Klon fällt.
/// Jede Session, die Audio sendet, abonniert die Frames.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: String,
    label: String,
    input_level: Arc<Mutex<f32>>,
    frames: broadcast::Sender<AudioFrame>,
    _resource: Option<Box<dyn Any + Send + Sync>>,
}

impl MediaStream {
    /// Stream ohne angehängte Ressource
    pub fn new(label: impl Into<String>) -> Self {
        Self::build(label.into(), Arc::new(Mutex::new(0.0)), frame_channel(), None)
    }

    /// Stream, der eine laufende Aufnahme am Leben hält. Die Aufnahme
    /// schreibt ihre Frames in `frames`.
    pub fn with_resource(
        label: impl Into<String>,
        input_level: Arc<Mutex<f32>>,
        frames: broadcast::Sender<AudioFrame>,
        resource: impl Any + Send + Sync,
    ) -> Self {
        Self::build(label.into(), input_level, frames, Some(Box::new(resource)))
    }

    fn build(
        label: String,
        input_level: Arc<Mutex<f32>>,
        frames: broadcast::Sender<AudioFrame>,
        resource: Option<Box<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: Uuid::new_v4().to_string(),
                label,
                input_level,
                frames,
                _resource: resource,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Aktueller Eingangspegel (RMS, 0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.inner.input_level.lock()
    }

    /// Abonniert die aufgenommenen Frames
    pub fn subscribe_frames(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.frames.subscribe()
    }

    /// Speist einen Frame ein, z.B. aus einer externen Quelle
    pub fn publish(&self, frame: AudioFrame) {
        let _ = self.inner.frames.send(frame);
    }
}

/// Kanal für die Frames einer Aufnahme
pub fn frame_channel() -> broadcast::Sender<AudioFrame> {
    broadcast::channel(FRAME_BACKLOG).0
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Zugriff auf das lokale Mikrofon
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Fordert das Mikrofon an. Kann unbegrenzt auf den Nutzer warten.
    async fn acquire_audio(&self) -> Result<MediaStream, MediaError>;
}

/// Erzeugt synthetische Töne (Oszillator + Gain + Mixer)
pub trait ToneSynth: Send + Sync {
    fn create_tone(&self, frequency: f32, gain: f32) -> Result<Arc<dyn ToneHandle>, MediaError>;
}

/// Ein laufender oder vorbereiteter Ton
pub trait ToneHandle: Send + Sync {
    fn start(&self) -> Result<(), MediaError>;

    fn set_frequency(&self, frequency: f32);

    fn frequency(&self) -> f32;

    fn stop(&self);

    /// Gibt das Audio-Gerät frei
    fn close(&self);
}

/// Ausgabe für empfangenes Audio
pub trait PlaybackSink: Send + Sync {
    /// Direkte Wiedergabe eines echten Audio-Tracks
    fn play(&self, track: RemoteTrack) -> Result<(), PlaybackError>;

    /// Wiedergabe über eine eigene Verarbeitungskette
    fn play_processed(&self, track: RemoteTrack) -> Result<(), PlaybackError>;

    /// Trennt die aktuelle Wiedergabe
    fn detach(&self);
}

// ============================================================================
// MEDIA ACQUIRER
// ============================================================================

#[derive(Debug, Clone)]
enum AcquireState {
    Idle,
    InFlight,
    Ready(MediaStream),
}

/// Ergebnis einer Anforderung
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// Neu angefordert
    Acquired(MediaStream),
    /// Bereits vorhanden, keine erneute Anfrage
    Cached(MediaStream),
    /// Eine andere Anforderung läuft noch
    InFlight,
}

/// Fordert das Mikrofon höchstens einmal pro Prozess an
pub struct MediaAcquirer {
    capture: Arc<dyn AudioCapture>,
    state: Mutex<AcquireState>,
}

/// Setzt `InFlight` zurück, falls die Anforderung abgebrochen wird
struct InFlightGuard<'a> {
    state: &'a Mutex<AcquireState>,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = AcquireState::Idle;
        }
    }
}

impl MediaAcquirer {
    pub fn new(capture: Arc<dyn AudioCapture>) -> Self {
        Self {
            capture,
            state: Mutex::new(AcquireState::Idle),
        }
    }

    /// Fordert das Mikrofon an, sofern es nicht schon vorhanden ist oder
    /// gerade angefordert wird
    pub async fn acquire(&self) -> Result<Acquisition, MediaError> {
        {
            let mut state = self.state.lock();
            match &*state {
                AcquireState::Ready(stream) => return Ok(Acquisition::Cached(stream.clone())),
                AcquireState::InFlight => return Ok(Acquisition::InFlight),
                AcquireState::Idle => *state = AcquireState::InFlight,
            }
        }

        let mut guard = InFlightGuard {
            state: &self.state,
            armed: true,
        };

        let result = self.capture.acquire_audio().await;
        guard.armed = false;

        match result {
            Ok(stream) => {
                tracing::info!("Microphone acquired: {}", stream.label());
                *self.state.lock() = AcquireState::Ready(stream.clone());
                Ok(Acquisition::Acquired(stream))
            }
            Err(e) => {
                tracing::warn!("Microphone acquisition failed: {}", e);
                *self.state.lock() = AcquireState::Idle;
                Err(e)
            }
        }
    }

    /// Der gecachte Stream, falls vorhanden
    pub fn current(&self) -> Option<MediaStream> {
        match &*self.state.lock() {
            AcquireState::Ready(stream) => Some(stream.clone()),
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(*self.state.lock(), AcquireState::InFlight)
    }

    /// Gibt den gecachten Stream frei
    pub fn release(&self) {
        let mut state = self.state.lock();
        if matches!(*state, AcquireState::Ready(_)) {
            tracing::info!("Microphone released");
            *state = AcquireState::Idle;
        }
    }
}

impl std::fmt::Debug for MediaAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAcquirer")
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCapture;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_acquire_reuses_cached_stream() {
        let capture = Arc::new(FakeCapture::granting());
        let acquirer = MediaAcquirer::new(capture.clone());

        let first = match acquirer.acquire().await.unwrap() {
            Acquisition::Acquired(stream) => stream,
            other => panic!("unexpected {:?}", other),
        };
        let second = match acquirer.acquire().await.unwrap() {
            Acquisition::Cached(stream) => stream,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(first, second);
        assert_eq!(first.id(), second.id());
        assert_eq!(capture.prompts(), 1);
    }

    #[tokio::test]
    async fn test_denied_acquire_can_be_retried() {
        let capture = Arc::new(FakeCapture::denying());
        let acquirer = MediaAcquirer::new(capture.clone());

        assert!(matches!(
            acquirer.acquire().await,
            Err(MediaError::PermissionDenied(_))
        ));
        assert!(acquirer.current().is_none());
        assert!(!acquirer.is_in_flight());

        capture.set_grant(true);
        assert!(matches!(
            acquirer.acquire().await,
            Ok(Acquisition::Acquired(_))
        ));
        assert_eq!(capture.prompts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_skips_while_in_flight() {
        let capture = Arc::new(FakeCapture::granting().with_delay(Duration::from_secs(3)));
        let acquirer = Arc::new(MediaAcquirer::new(capture.clone()));

        let pending = {
            let acquirer = Arc::clone(&acquirer);
            tokio::spawn(async move { acquirer.acquire().await })
        };
        tokio::task::yield_now().await;
        assert!(acquirer.is_in_flight());

        assert_eq!(acquirer.acquire().await, Ok(Acquisition::InFlight));

        assert!(matches!(
            pending.await.unwrap(),
            Ok(Acquisition::Acquired(_))
        ));
        assert_eq!(capture.prompts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquire_resets_state() {
        let capture = Arc::new(FakeCapture::granting().with_delay(Duration::from_secs(60)));
        let acquirer = MediaAcquirer::new(capture);

        let attempt = tokio::time::timeout(Duration::from_secs(1), acquirer.acquire()).await;
        assert!(attempt.is_err());
        assert!(!acquirer.is_in_flight());
    }

    #[tokio::test]
    async fn test_clones_share_captured_frames() {
        let stream = MediaStream::new("mic");
        let shared = stream.clone();
        let mut frames = shared.subscribe_frames();

        stream.publish(Arc::from(vec![0.5; FRAME_SAMPLES]));

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert_eq!(frame[0], 0.5);
    }

    #[tokio::test]
    async fn test_release_forgets_stream() {
        let capture = Arc::new(FakeCapture::granting());
        let acquirer = MediaAcquirer::new(capture.clone());
        acquirer.acquire().await.unwrap();
        acquirer.release();
        assert!(acquirer.current().is_none());
        acquirer.acquire().await.unwrap();
        assert_eq!(capture.prompts(), 2);
    }
}
