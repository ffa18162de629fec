//! Streaming PCM playback shared by every open sequencer.
//!
//! The actual rodio output lives on a dedicated OS thread; the async side
//! talks to it through a command channel so no audio handle ever crosses an
//! await point. One track plays at a time; streaming a chunk for a new track
//! id replaces the previous one.

pub mod analysis;

pub use analysis::{AnalysisChannel, BIN_COUNT};

use crate::config::SAMPLE_RATE;
use crate::error::{Error, Result};
use analysis::Analyzer;
use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Uninitialized,
    Idle,
    Playing,
    Destroyed,
}

/// Notifications published by the playback service.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    StateChange(PlayerState),
    Progress {
        track_id: String,
        samples_streamed: u64,
    },
    Error(String),
}

/// Where playback was cut by [`Playback::interrupt`]. The offset counts
/// samples actually played, never more than what was streamed for the track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCut {
    pub track_id: String,
    pub sample_offset: u64,
}

/// Injectable playback surface. Production code uses [`AudioPlayer`];
/// tests substitute a fake.
#[async_trait]
pub trait Playback: Send + Sync {
    /// Opens the audio output. Idempotent and safe to retry after failure.
    async fn initialize(&self) -> Result<()>;

    /// Appends raw 16-bit samples to the output buffer for `track_id`.
    fn stream_chunk(&self, pcm: &[i16], track_id: &str) -> Result<()>;

    /// Stops playback immediately, reporting where the active track was cut.
    async fn interrupt(&self) -> Result<Option<TrackCut>>;

    /// Resolves once all queued audio has been played out.
    async fn wait_idle(&self) -> Result<()>;

    /// Amplitude per frequency bin for a logical channel. Never fails;
    /// returns silence when uninitialized so visualization loops can poll
    /// every frame.
    fn frequencies(&self, channel: AnalysisChannel) -> Vec<f32>;

    /// Ensures the output is runnable before the first sound. No-op where
    /// the platform imposes no such restriction.
    async fn unlock(&self) -> Result<()>;

    /// Tears down the output thread. Terminal.
    async fn destroy(&self);

    fn state(&self) -> PlayerState;

    fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent>;
}

// --- Worker commands ---

enum Command {
    Append { samples: Vec<f32>, new_track: bool },
    Interrupt { reply: oneshot::Sender<u64> },
    IsIdle { reply: oneshot::Sender<bool> },
    Unlock,
    Shutdown,
}

#[derive(Default)]
struct TrackProgress {
    track_id: Option<String>,
    samples_streamed: u64,
}

pub struct AudioPlayer {
    state: Mutex<PlayerState>,
    analyzer: Mutex<Analyzer>,
    track: Mutex<TrackProgress>,
    cmd_tx: Mutex<Option<std::sync::mpsc::Sender<Command>>>,
    /// Serializes concurrent `initialize` calls.
    init_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PlaybackEvent>,
}

static GLOBAL: Lazy<Arc<AudioPlayer>> = Lazy::new(|| Arc::new(AudioPlayer::new()));

impl AudioPlayer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(PlayerState::Uninitialized),
            analyzer: Mutex::new(Analyzer::new()),
            track: Mutex::new(TrackProgress::default()),
            cmd_tx: Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Process-wide shared instance. All sequencers stream into the same
    /// output; a new scene should interrupt it before loading.
    pub fn global() -> Arc<AudioPlayer> {
        GLOBAL.clone()
    }

    fn set_state(&self, next: PlayerState) {
        let mut state = self.state.lock().unwrap();
        if *state == PlayerState::Destroyed || *state == next {
            return;
        }
        *state = next;
        let _ = self.events.send(PlaybackEvent::StateChange(next));
    }

    fn sender(&self) -> Option<std::sync::mpsc::Sender<Command>> {
        self.cmd_tx.lock().unwrap().clone()
    }
}

impl Default for AudioPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Playback for AudioPlayer {
    async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if *self.state.lock().unwrap() == PlayerState::Destroyed {
            return Err(Error::Initialization("playback already destroyed".into()));
        }
        if self.sender().is_some() {
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("storyweave-audio".into())
            .spawn(move || worker_loop(cmd_rx, ready_tx))
            .map_err(|e| Error::Initialization(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.cmd_tx.lock().unwrap() = Some(cmd_tx);
                self.set_state(PlayerState::Idle);
                debug!("audio output opened at {} Hz", SAMPLE_RATE);
                Ok(())
            }
            Ok(Err(message)) => Err(Error::Initialization(message)),
            Err(_) => Err(Error::Initialization("audio thread exited early".into())),
        }
    }

    fn stream_chunk(&self, pcm: &[i16], track_id: &str) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(Error::NotInitialized);
        };

        let samples = pcm16_to_f32(pcm);
        self.analyzer.lock().unwrap().push(track_id, &samples);

        let (new_track, streamed) = {
            let mut track = self.track.lock().unwrap();
            let new_track = track.track_id.as_deref() != Some(track_id);
            if new_track {
                track.track_id = Some(track_id.to_string());
                track.samples_streamed = 0;
            }
            track.samples_streamed += samples.len() as u64;
            (new_track, track.samples_streamed)
        };

        if tx.send(Command::Append { samples, new_track }).is_err() {
            let _ = self
                .events
                .send(PlaybackEvent::Error("audio thread terminated".into()));
            return Err(Error::Initialization("audio thread terminated".into()));
        }

        self.set_state(PlayerState::Playing);
        let _ = self.events.send(PlaybackEvent::Progress {
            track_id: track_id.to_string(),
            samples_streamed: streamed,
        });
        Ok(())
    }

    async fn interrupt(&self) -> Result<Option<TrackCut>> {
        let Some(tx) = self.sender() else {
            // Mirrors stream players that treat interrupt-before-init as a
            // harmless no-op.
            return Ok(None);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Command::Interrupt { reply: reply_tx }).is_err() {
            return Ok(None);
        }
        let played = reply_rx.await.unwrap_or(0);

        let cut = {
            let mut track = self.track.lock().unwrap();
            let streamed = track.samples_streamed;
            track.samples_streamed = 0;
            track.track_id.take().map(|track_id| TrackCut {
                track_id,
                sample_offset: played.min(streamed),
            })
        };
        self.set_state(PlayerState::Idle);
        Ok(cut)
    }

    async fn wait_idle(&self) -> Result<()> {
        loop {
            let Some(tx) = self.sender() else {
                return Ok(());
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Command::IsIdle { reply: reply_tx }).is_err() {
                return Ok(());
            }
            match reply_rx.await {
                Ok(true) | Err(_) => break,
                Ok(false) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        self.set_state(PlayerState::Idle);
        Ok(())
    }

    fn frequencies(&self, channel: AnalysisChannel) -> Vec<f32> {
        if *self.state.lock().unwrap() == PlayerState::Uninitialized {
            return vec![0.0; BIN_COUNT];
        }
        self.analyzer.lock().unwrap().magnitudes(channel)
    }

    async fn unlock(&self) -> Result<()> {
        if let Some(tx) = self.sender() {
            let _ = tx.send(Command::Unlock);
        }
        Ok(())
    }

    async fn destroy(&self) {
        if let Some(tx) = self.cmd_tx.lock().unwrap().take() {
            let _ = tx.send(Command::Shutdown);
        }
        self.set_state(PlayerState::Destroyed);
    }

    fn state(&self) -> PlayerState {
        *self.state.lock().unwrap()
    }

    fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }
}

pub(crate) fn pcm16_to_f32(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|s| *s as f32 / 32768.0).collect()
}

// --- Audio thread ---

fn worker_loop(
    rx: std::sync::mpsc::Receiver<Command>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    use rodio::buffer::SamplesBuffer;
    use rodio::{OutputStreamBuilder, Sink};

    // The stream handle must outlive every sink connected to it.
    let stream = match OutputStreamBuilder::open_default_stream() {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut sink: Option<Sink> = None;
    let mut appended: u64 = 0;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Append { samples, new_track } => {
                if new_track {
                    if let Some(old) = sink.take() {
                        old.stop();
                    }
                    appended = 0;
                }
                let sink = sink.get_or_insert_with(|| Sink::connect_new(&stream.mixer()));
                appended += samples.len() as u64;
                sink.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));
            }
            Command::Interrupt { reply } => {
                let played = match sink.take() {
                    Some(active) => {
                        let pos =
                            (active.get_pos().as_secs_f64() * SAMPLE_RATE as f64) as u64;
                        active.stop();
                        pos.min(appended)
                    }
                    None => 0,
                };
                appended = 0;
                let _ = reply.send(played);
            }
            Command::IsIdle { reply } => {
                let idle = sink.as_ref().map(|s| s.empty()).unwrap_or(true);
                let _ = reply.send(idle);
            }
            Command::Unlock => {
                if let Some(sink) = &sink {
                    sink.play();
                }
            }
            Command::Shutdown => break,
        }
    }
    if let Some(sink) = sink.take() {
        sink.stop();
    }
    warn!("audio worker thread exiting");
}
