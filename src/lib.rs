//! Event sequencing and realtime audio streaming for interactive
//! storytelling.
//!
//! The pipeline runs leaf to root: [`script`] parses character and scene
//! documents into typed events, [`sequencer`] drives them one at a time
//! through a [`channel`] to the realtime speech backend, and streamed PCM
//! lands in the shared [`audio`] service, which also feeds the
//! frequency-domain data a visualization polls every frame. [`story`] wraps
//! the HTTP backend that produces the story graph in the first place.

pub mod audio;
pub mod channel;
pub mod config;
pub mod error;
pub mod script;
pub mod sequencer;
pub mod story;

pub use audio::{AnalysisChannel, AudioPlayer, Playback, PlaybackEvent, PlayerState, TrackCut};
pub use channel::{ChannelEvent, RealtimeChannel, SessionOptions, SpeechChannel};
pub use config::{Config, SAMPLE_RATE};
pub use error::{Error, Result};
pub use script::{Character, EventKind, ParsedScene, SceneParser, StoryEvent, Voice};
pub use sequencer::{EventState, EventStatus, SequencerOptions, StorySequencer};
pub use story::{ChildProfile, Story, StoryClient};
