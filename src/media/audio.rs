//! cpal Audio - Mikrofon, Testton und Wiedergabe
//!
//! cpal Streams sind nicht auf allen Plattformen `Send`. Jeder Stream lebt
//! daher auf einem eigenen Thread, der ihn bis zum Stop-Signal hält.

use super::g711::{G711, G711_SAMPLE_RATE};
use super::{
    frame_channel, AudioCapture, AudioFrame, MediaError, MediaStream, PlaybackError,
    PlaybackSink, ToneHandle, ToneSynth, FRAME_SAMPLES,
};
use crate::signaling::RemoteTrack;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use thiserror::Error;
use tokio::task::JoinHandle;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bevorzugte Sample Rate
const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
const FRAME_SIZE: usize = 960;

/// Buffer Size für den Wiedergabe-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

/// Verstärkung der Verarbeitungskette (L16 Payloads)
const PROCESSED_GAIN: f32 = 0.8;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// STREAM THREAD
// ============================================================================

/// Hält einen cpal Stream auf einem eigenen Thread am Leben
struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blockiert bis Stop-Signal oder Sender gedroppt
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::StreamBuildError("audio thread exited".to_string()))??;

        Ok(Self { stop_tx })
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn default_input_device() -> Result<Device, AudioError> {
    cpal::default_host()
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)
}

fn default_output_device() -> Result<Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Findet die beste Output-Konfiguration
fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    // Priorität: 48kHz F32 > andere Rate F32 > erste verfügbare
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32);

    for config in f32_configs.clone() {
        if config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
    }

    if let Some(config) = f32_configs.last() {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    if let Some(config) = configs.first() {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

/// Einfaches Linear-Resampling
fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (samples.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = samples.get(idx).copied().unwrap_or(0.0);
            let s2 = samples.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Mittelt interleaved Kanäle zu Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Schneidet vollständige 20ms Frames ab, der Rest bleibt liegen
fn drain_frames(pending: &mut Vec<f32>) -> Vec<AudioFrame> {
    let complete = pending.len() / FRAME_SAMPLES * FRAME_SAMPLES;
    let frames = pending[..complete]
        .chunks_exact(FRAME_SAMPLES)
        .map(AudioFrame::from)
        .collect();
    pending.drain(..complete);
    frames
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Mikrofon über das Standard-Eingabegerät
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCapture;

impl CpalCapture {
    fn open() -> Result<MediaStream, AudioError> {
        let device = default_input_device()?;
        let label = device.name().unwrap_or_else(|_| "default input".to_string());
        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let input_level = Arc::new(Mutex::new(0.0f32));
        let level = Arc::clone(&input_level);
        let frames = frame_channel();
        let frame_tx = frames.clone();
        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;
        let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 4);

        let thread = StreamThread::spawn("audio-capture", move || {
            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if data.is_empty() {
                            return;
                        }
                        // Audio Level berechnen (RMS)
                        let rms: f32 =
                            (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                        *level.lock() = rms.min(1.0);

                        let mono = downmix(data, channels);
                        pending.extend(resample(&mono, device_rate, G711_SAMPLE_RATE));
                        for frame in drain_frames(&mut pending) {
                            // Ohne Empfänger (kein Call) verworfen
                            let _ = frame_tx.send(frame);
                        }
                    },
                    |err| {
                        tracing::error!("Audio capture error: {}", err);
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

            stream
                .play()
                .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
            Ok(stream)
        })?;

        Ok(MediaStream::with_resource(label, input_level, frames, thread))
    }
}

#[async_trait]
impl AudioCapture for CpalCapture {
    async fn acquire_audio(&self) -> Result<MediaStream, MediaError> {
        tokio::task::spawn_blocking(Self::open)
            .await
            .map_err(|e| MediaError::PermissionDenied(e.to_string()))?
            .map_err(|e| MediaError::PermissionDenied(e.to_string()))
    }
}

// ============================================================================
// TONE
// ============================================================================

/// Sinus-Generator auf dem Standard-Ausgabegerät
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalTone;

impl ToneSynth for CpalTone {
    fn create_tone(&self, frequency: f32, gain: f32) -> Result<Arc<dyn ToneHandle>, MediaError> {
        let device = default_output_device().map_err(|e| MediaError::Device(e.to_string()))?;
        let config =
            find_best_output_config(&device).map_err(|e| MediaError::Device(e.to_string()))?;

        Ok(Arc::new(CpalToneHandle {
            device: Mutex::new(Some(device)),
            config,
            frequency: Arc::new(AtomicU32::new(frequency.to_bits())),
            gain,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }))
    }
}

struct CpalToneHandle {
    device: Mutex<Option<Device>>,
    config: StreamConfig,
    /// f32 Bits, im Audio-Callback gelesen
    frequency: Arc<AtomicU32>,
    gain: f32,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<StreamThread>>,
}

impl ToneHandle for CpalToneHandle {
    fn start(&self) -> Result<(), MediaError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            self.running.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let device = self
            .device
            .lock()
            .take()
            .ok_or_else(|| MediaError::Device("tone closed".to_string()))?;

        let config = self.config.clone();
        let sample_rate = config.sample_rate.0 as f32;
        let channels = config.channels as usize;
        let frequency = Arc::clone(&self.frequency);
        let running = Arc::clone(&self.running);
        let gain = self.gain;
        running.store(true, Ordering::SeqCst);

        let spawned = StreamThread::spawn("audio-tone", move || {
            let mut phase = 0.0f32;
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let on = running.load(Ordering::Relaxed);
                        let step = f32::from_bits(frequency.load(Ordering::Relaxed)) / sample_rate;
                        for frame in data.chunks_mut(channels) {
                            let sample = if on {
                                (phase * std::f32::consts::TAU).sin() * gain
                            } else {
                                0.0
                            };
                            phase = (phase + step).fract();
                            for s in frame.iter_mut() {
                                *s = sample;
                            }
                        }
                    },
                    |err| {
                        tracing::error!("Tone playback error: {}", err);
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;
            stream
                .play()
                .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
            Ok(stream)
        });

        match spawned {
            Ok(spawned) => {
                *thread = Some(spawned);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(MediaError::Device(e.to_string()))
            }
        }
    }

    fn set_frequency(&self, frequency: f32) {
        self.frequency.store(frequency.to_bits(), Ordering::Relaxed);
    }

    fn frequency(&self) -> f32 {
        f32::from_bits(self.frequency.load(Ordering::Relaxed))
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.stop();
        self.device.lock().take();
        self.thread.lock().take();
    }
}

// ============================================================================
// PLAYBACK
// ============================================================================

/// Wiedergabe empfangener Tracks auf dem Standard-Ausgabegerät
#[derive(Default)]
pub struct CpalPlayback {
    current: Mutex<Option<Pipeline>>,
}

/// Laufende Wiedergabe: Ausgabe-Thread und Feeder-Task
struct Pipeline {
    _output: StreamThread,
    feeder: JoinHandle<()>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Decoder {
    G711(G711),
    /// 16-bit linear PCM, big endian, über die Gain-Stufe
    Linear16 { gain: f32 },
}

impl Decoder {
    fn decode(&self, payload: &[u8]) -> Vec<f32> {
        match self {
            Self::G711(codec) => codec.decode(payload),
            Self::Linear16 { gain } => payload
                .chunks_exact(2)
                .map(|b| i16::from_be_bytes([b[0], b[1]]) as f32 / 32768.0 * gain)
                .collect(),
        }
    }
}

/// Decoder für die direkte Wiedergabe, nur G.711
fn direct_decoder(codec: &str) -> Result<Decoder, PlaybackError> {
    G711::from_mime(codec)
        .map(Decoder::G711)
        .ok_or_else(|| PlaybackError::Device(format!("unsupported codec {}", codec)))
}

impl CpalPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, track: RemoteTrack, decoder: Decoder) -> Result<(), PlaybackError> {
        let device = default_output_device().map_err(|e| PlaybackError::Device(e.to_string()))?;
        let config = match find_best_output_config(&device) {
            Ok(config) => config,
            Err(e) => return Err(PlaybackError::Device(e.to_string())),
        };

        let buffer = Arc::new(Mutex::new(HeapRb::<f32>::new(RING_BUFFER_SIZE)));
        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let playback_buffer = Arc::clone(&buffer);
        let output = StreamThread::spawn("audio-playback", move || {
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut buffer = playback_buffer.lock();
                        // Mono auf alle Kanäle verteilen
                        for frame in data.chunks_mut(channels) {
                            let sample = buffer.try_pop().unwrap_or(0.0);
                            for s in frame.iter_mut() {
                                *s = sample;
                            }
                        }
                    },
                    |err| {
                        tracing::error!("Audio playback error: {}", err);
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;
            stream
                .play()
                .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
            Ok(stream)
        });

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Err(PlaybackError::Blocked {
                    track,
                    reason: e.to_string(),
                })
            }
        };

        let mut payloads = track
            .take_payloads()
            .ok_or_else(|| PlaybackError::Device(format!("track {} already attached", track.id)))?;

        let track_rate = track.clock_rate;
        let feeder = tokio::spawn(async move {
            while let Some(payload) = payloads.recv().await {
                let samples = resample(&decoder.decode(&payload), track_rate, device_rate);
                let mut buffer = buffer.lock();
                for sample in samples {
                    let _ = buffer.try_push(sample);
                }
            }
        });

        tracing::info!(
            "Remote audio attached (track {}, {} @ {} Hz)",
            track.id,
            track.codec,
            track_rate
        );
        *self.current.lock() = Some(Pipeline {
            _output: output,
            feeder,
        });
        Ok(())
    }
}

impl PlaybackSink for CpalPlayback {
    fn play(&self, track: RemoteTrack) -> Result<(), PlaybackError> {
        let decoder = direct_decoder(&track.codec)?;
        self.start(track, decoder)
    }

    fn play_processed(&self, track: RemoteTrack) -> Result<(), PlaybackError> {
        self.start(
            track,
            Decoder::Linear16 {
                gain: PROCESSED_GAIN,
            },
        )
    }

    fn detach(&self) {
        if self.current.lock().take().is_some() {
            tracing::info!("Remote audio detached");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_doubles_length() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let out = resample(&samples, 8000, 16000);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.5);
        assert_eq!(out[2], 1.0);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.25, -0.25];
        assert_eq!(resample(&samples, 48000, 48000), samples);
    }

    #[test]
    fn test_direct_decoder_only_accepts_g711() {
        assert!(matches!(
            direct_decoder("audio/PCMU"),
            Ok(Decoder::G711(G711::Pcmu))
        ));
        assert!(matches!(
            direct_decoder("audio/PCMA"),
            Ok(Decoder::G711(G711::Pcma))
        ));
        match direct_decoder("audio/opus") {
            Err(PlaybackError::Device(reason)) => assert!(reason.contains("audio/opus")),
            other => panic!("unexpected decoder: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_capture_frames_are_20ms_at_8khz() {
        let mut pending = Vec::new();
        // 25ms Stereo @ 48kHz
        let stereo = vec![0.5f32; 1200 * 2];
        pending.extend(resample(&downmix(&stereo, 2), 48000, G711_SAMPLE_RATE));

        let frames = drain_frames(&mut pending);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_SAMPLES);
        assert!(frames[0].iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert_eq!(pending.len(), 200 - FRAME_SAMPLES);
    }

    #[test]
    fn test_linear16_decoder_applies_gain() {
        let decoder = Decoder::Linear16 { gain: 0.5 };
        let samples = decoder.decode(&[0x40, 0x00, 0xC0, 0x00, 0x01]);
        assert_eq!(samples, vec![0.25, -0.25]);
    }
}
