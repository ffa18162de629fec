//! Drives a scene's events through the speech channel one at a time.
//!
//! Each loaded event owns a lifecycle `pending -> playing -> complete`; an
//! error or interruption reverts `playing` back to `pending` so the caller
//! can retry. At most one event is `playing` at any instant, tracked by
//! `current_event_id` — the two always change together.

use crate::audio::Playback;
use crate::channel::{ChannelEvent, SessionOptions, SpeechChannel};
use crate::config::Config;
use crate::error::Result;
use crate::script::{EventKind, ParsedScene, StoryEvent, Voice};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Samples per chunk when replaying cached audio (200 ms at 24 kHz).
const REPLAY_CHUNK: usize = 4800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Playing,
    Complete,
}

/// Read-only view of one tracked event.
#[derive(Debug, Clone)]
pub struct EventState {
    pub id: String,
    pub text: String,
    pub status: EventStatus,
    pub cached: bool,
}

struct AudioEvent {
    story: StoryEvent,
    status: EventStatus,
    /// Accumulated decoded samples; kept after completion for replay.
    decoded: Vec<i16>,
}

#[derive(Default)]
struct Inner {
    scene_id: Option<String>,
    events: Vec<AudioEvent>,
    current_event_id: Option<String>,
    /// Set once the first event of the loaded scene has been kicked off.
    initialized: bool,
    /// Bumped on every lifecycle transition; lets a stale watchdog tell that
    /// the world moved on without it.
    generation: u64,
}

impl Inner {
    fn find_mut(&mut self, id: &str) -> Option<&mut AudioEvent> {
        self.events.iter_mut().find(|e| e.story.id == id)
    }

    /// Reverts the playing event (if any) to pending and discards its
    /// partial audio. Returns the reverted id.
    fn revert_current(&mut self) -> Option<String> {
        let id = self.current_event_id.take()?;
        self.generation += 1;
        if let Some(event) = self.find_mut(&id) {
            event.status = EventStatus::Pending;
            event.decoded.clear();
        }
        Some(id)
    }
}

#[derive(Debug, Clone)]
pub struct SequencerOptions {
    pub default_voice: Voice,
    /// When true, completing an event immediately schedules the next one.
    /// When false the caller drives every step. Fixed per instance.
    pub auto_advance: bool,
    pub watchdog: Duration,
    pub turn_detection: bool,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            default_voice: Voice::default(),
            auto_advance: true,
            watchdog: Duration::from_secs(30),
            turn_detection: false,
        }
    }
}

impl From<&Config> for SequencerOptions {
    fn from(config: &Config) -> Self {
        Self {
            default_voice: config.realtime.default_voice,
            auto_advance: config.playback.auto_advance,
            watchdog: Duration::from_secs(config.playback.watchdog_secs),
            turn_detection: config.realtime.turn_detection,
        }
    }
}

pub struct StorySequencer {
    inner: Mutex<Inner>,
    channel: Arc<dyn SpeechChannel>,
    playback: Arc<dyn Playback>,
    options: SequencerOptions,
}

impl StorySequencer {
    /// Full production wiring: initializes the shared playback service,
    /// connects a realtime channel, applies the default session settings and
    /// returns the running sequencer.
    pub async fn connect(config: &Config) -> Result<Arc<Self>> {
        use crate::audio::AudioPlayer;
        use crate::channel::RealtimeChannel;

        let playback = AudioPlayer::global();
        playback.initialize().await?;

        let (channel, events) = RealtimeChannel::new(config.realtime.clone());
        channel.connect().await?;

        let options = SequencerOptions::from(config);
        channel
            .configure(&SessionOptions {
                voice: options.default_voice,
                instructions: None,
                turn_detection: options.turn_detection,
            })
            .await?;

        Ok(Self::spawn(Arc::new(channel), playback, events, options))
    }

    /// Wires the sequencer to a channel event stream and starts the pump
    /// task that reacts to streamed audio and terminal events.
    pub fn spawn(
        channel: Arc<dyn SpeechChannel>,
        playback: Arc<dyn Playback>,
        mut events: mpsc::Receiver<ChannelEvent>,
        options: SequencerOptions,
    ) -> Arc<Self> {
        let sequencer = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            channel,
            playback,
            options,
        });

        let pump = sequencer.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                pump.handle_channel_event(event).await;
            }
            debug!("channel event stream closed");
        });

        sequencer
    }

    /// Replaces the tracked scene. Any prior events are dropped, playback on
    /// the shared service is interrupted first, and nothing starts playing
    /// until the caller asks for it.
    pub async fn load_scene(&self, scene: &ParsedScene) {
        if let Ok(Some(cut)) = self.playback.interrupt().await {
            if let Err(e) = self.channel.cancel(&cut.track_id, cut.sample_offset).await {
                warn!("failed to cancel in-flight item {}: {}", cut.track_id, e);
            }
        }

        let mut inner = self.inner.lock().await;
        inner.scene_id = Some(scene.id.clone());
        inner.current_event_id = None;
        inner.initialized = false;
        inner.generation += 1;
        inner.events = scene
            .events
            .iter()
            .map(|story| AudioEvent {
                story: story.clone(),
                status: EventStatus::Pending,
                decoded: Vec::new(),
            })
            .collect();
        info!(
            "scene {} loaded with {} events",
            scene.id,
            inner.events.len()
        );
    }

    /// Kicks off the first event exactly once per loaded scene. Subsequent
    /// calls are no-ops until the next `load_scene`.
    pub async fn initialize_first_event(self: &Arc<Self>) -> Option<String> {
        {
            let mut inner = self.inner.lock().await;
            if inner.scene_id.is_none() || inner.initialized {
                return None;
            }
            inner.initialized = true;
        }
        self.process_next_event().await
    }

    /// Synthesizes the first pending event in scene order. Returns the id of
    /// the event now playing, or `None` when no scene is loaded, something is
    /// already playing, no pending event remains, or the next event is an
    /// `input` beat awaiting [`resolve_input`](Self::resolve_input).
    pub async fn process_next_event(self: &Arc<Self>) -> Option<String> {
        let (event_id, voice, instructions, text, generation) = {
            let mut inner = self.inner.lock().await;
            if inner.scene_id.is_none() || inner.current_event_id.is_some() {
                debug!("not ready for next event");
                return None;
            }

            let next = inner
                .events
                .iter_mut()
                .find(|e| e.status == EventStatus::Pending)?;

            if next.story.kind == EventKind::Input {
                // Input beats pause the sequence; no synthesis happens until
                // the interaction is resolved externally.
                debug!("sequence paused at input event {}", next.story.id);
                return None;
            }

            next.status = EventStatus::Playing;
            next.decoded.clear();
            let voice = next
                .story
                .character
                .as_ref()
                .map(|c| c.voice)
                .unwrap_or(self.options.default_voice);
            let id = next.story.id.clone();
            let instructions = persona_instructions(&next.story);
            let text = next.story.text.clone();

            inner.current_event_id = Some(id.clone());
            inner.generation += 1;
            (id, voice, instructions, text, inner.generation)
        };

        info!("processing event {}", event_id);
        let session = SessionOptions {
            voice,
            instructions: None,
            turn_detection: self.options.turn_detection,
        };
        let submitted = match self.channel.configure(&session).await {
            Ok(()) => self.channel.submit(&instructions, &text).await,
            Err(e) => Err(e),
        };

        if let Err(e) = submitted {
            error!("failed to submit event {}: {}", event_id, e);
            self.inner.lock().await.revert_current();
            return None;
        }

        self.arm_watchdog(event_id.clone(), generation);
        Some(event_id)
    }

    /// Marks an `input` event as done and, in auto-advance mode, moves on.
    pub async fn resolve_input(self: &Arc<Self>, id: &str) -> Option<String> {
        {
            let mut inner = self.inner.lock().await;
            let event = inner.find_mut(id)?;
            if event.story.kind != EventKind::Input || event.status != EventStatus::Pending {
                return None;
            }
            event.status = EventStatus::Complete;
            inner.generation += 1;
        }
        if self.options.auto_advance {
            self.process_next_event().await
        } else {
            None
        }
    }

    /// Replays an already-synthesized event from its cached audio, without
    /// touching the network. No-op unless the event is `complete` with cached
    /// samples and nothing else is playing.
    pub async fn replay_event(&self, id: &str) -> Result<()> {
        let chunks: Vec<Vec<i16>> = {
            let mut inner = self.inner.lock().await;
            if inner.current_event_id.is_some() {
                return Ok(());
            }
            let Some(event) = inner.find_mut(id) else {
                return Ok(());
            };
            if event.status != EventStatus::Complete || event.decoded.is_empty() {
                return Ok(());
            }
            event.status = EventStatus::Playing;
            let chunks = event
                .decoded
                .chunks(REPLAY_CHUNK)
                .map(|c| c.to_vec())
                .collect();
            inner.current_event_id = Some(id.to_string());
            inner.generation += 1;
            chunks
        };

        let mut streamed = Ok(());
        for chunk in &chunks {
            if let Err(e) = self.playback.stream_chunk(chunk, id) {
                streamed = Err(e);
                break;
            }
        }
        if streamed.is_ok() {
            self.playback.wait_idle().await?;
        }

        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.find_mut(id) {
            event.status = EventStatus::Complete;
        }
        inner.current_event_id = None;
        inner.generation += 1;
        streamed
    }

    /// Stops playback and tells the backend exactly how much audio was heard,
    /// reverting the interrupted event for a later retry.
    pub async fn interrupt(&self) -> Result<()> {
        let cut = self.playback.interrupt().await?;
        let reverted = self.inner.lock().await.revert_current();
        if let (Some(cut), Some(id)) = (cut, reverted) {
            debug!(
                "event {} interrupted at sample {}",
                id, cut.sample_offset
            );
            self.channel.cancel(&cut.track_id, cut.sample_offset).await?;
        }
        Ok(())
    }

    /// Pure lookup; `None` for unknown ids.
    pub async fn event_status(&self, id: &str) -> Option<EventStatus> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .find(|e| e.story.id == id)
            .map(|e| e.status)
    }

    pub async fn events(&self) -> Vec<EventState> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .map(|e| EventState {
                id: e.story.id.clone(),
                text: e.story.text.clone(),
                status: e.status,
                cached: !e.decoded.is_empty(),
            })
            .collect()
    }

    pub async fn current_event_id(&self) -> Option<String> {
        self.inner.lock().await.current_event_id.clone()
    }

    async fn handle_channel_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::AudioDelta { item_id, samples } => {
                {
                    let mut inner = self.inner.lock().await;
                    let Some(current) = inner.current_event_id.clone() else {
                        debug!("dropping audio delta for {}: no active event", item_id);
                        return;
                    };
                    if let Some(event) = inner.find_mut(&current) {
                        event.decoded.extend_from_slice(&samples);
                    }
                }
                if let Err(e) = self.playback.stream_chunk(&samples, &item_id) {
                    warn!("failed to stream chunk for {}: {}", item_id, e);
                }
            }
            ChannelEvent::ItemComplete { item_id } => {
                let completed = {
                    let mut inner = self.inner.lock().await;
                    let Some(current) = inner.current_event_id.take() else {
                        return;
                    };
                    inner.generation += 1;
                    if let Some(event) = inner.find_mut(&current) {
                        event.status = EventStatus::Complete;
                    }
                    debug!("event {} complete (item {})", current, item_id);
                    current
                };
                info!("event {} finished", completed);
                if self.options.auto_advance {
                    self.process_next_event().await;
                }
            }
            ChannelEvent::Interrupted => {
                if let Err(e) = self.playback.interrupt().await {
                    warn!("interrupt propagation failed: {}", e);
                }
                if let Some(id) = self.inner.lock().await.revert_current() {
                    info!("event {} interrupted, back to pending", id);
                }
            }
            ChannelEvent::Error(message) => {
                error!("channel error: {}", message);
                self.inner.lock().await.revert_current();
            }
            ChannelEvent::Disconnected => {
                // Terminal for the in-flight request; same recovery as an
                // explicit error so the sequencer never hangs on it.
                warn!("realtime connection lost");
                self.inner.lock().await.revert_current();
            }
        }
    }

    /// Force-reverts a playing event if no terminal event arrives in time,
    /// so a silent backend cannot lock the sequencer up for good.
    fn arm_watchdog(self: &Arc<Self>, event_id: String, generation: u64) {
        let sequencer = self.clone();
        let window = self.options.watchdog;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut inner = sequencer.inner.lock().await;
            if inner.generation == generation
                && inner.current_event_id.as_deref() == Some(event_id.as_str())
            {
                warn!(
                    "no terminal event for {} within {:?}, reverting to pending",
                    event_id, window
                );
                inner.revert_current();
            }
        });
    }
}

/// Persona framing sent with every synthesis request. Events without a
/// character fall back to the fixed narrator persona.
fn persona_instructions(event: &StoryEvent) -> String {
    match &event.character {
        Some(character) => {
            let personality = serde_json::to_string(&character.personality)
                .unwrap_or_else(|_| "{}".to_string());
            let emotion = event
                .emotion
                .as_deref()
                .map(|e| format!(" Speak with {} emotion.", e))
                .unwrap_or_default();
            format!(
                "You are {}. {}. Your personality is {}.{} Say exactly: \"{}\"",
                character.name, character.prompt, personality, emotion, event.text
            )
        }
        None => format!(
            "You are the Narrator. Warm, friendly storyteller with a magical presence. \
             Your personality is engaging and imaginative, your goal is to guide children \
             through the story while building excitement, and your speech style is clear, \
             warm, and filled with wonder. Say exactly: \"{}\"",
            event.text
        ),
    }
}
