//! rampout
//!
//! Click-free real-time audio output: output stream lifecycle,
//! 50 ms volume ramps and lock-free state shared with the audio callback.

pub mod audio;
pub mod pipeline;
pub mod player;

pub use audio::{AudioBackend, AudioSystem, Fader, OutputError, SampleFormat};
pub use pipeline::SampleProducer;
pub use player::{Player, PlayerConfig, PlayingStateChange};
