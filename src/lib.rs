//! Seer - voice-driven conversational front end
//!
//! This library provides the client-side runtime for a spoken conversation
//! with a remote assistant:
//! - Microphone capture segmented into utterances by silence
//! - Ordered, non-overlapping playback of reply audio
//! - Streaming text-to-speech over a reconnecting WebSocket
//! - Camera polling against a recognition server
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   utterances    ┌──────────────────┐
//! │ voice::capture├────────────────►│     backend      │
//! └───────────────┘                 │  (HTTP + events) │
//!         ▲ pause/resume            └────────┬─────────┘
//!         │                                  │ audio
//! ┌───────┴────────┐   clips   ┌─────────────▼────────┐
//! │  voice::queue  │◄──────────┤ tts / vision / events│
//! └────────────────┘           └──────────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod socket;
pub mod tts;
pub mod vision;
pub mod voice;

pub use backend::BackendClient;
pub use config::{Config, Settings, TtsConfig};
pub use error::{Error, Result};
pub use socket::{ReadyState, ReconnectingSocket};
pub use tts::SpeechStream;
pub use vision::{CardSpotter, ReadingPoller, Stage, Watcher};
pub use voice::{AudioClip, PlaybackQueue, Utterance};
