//! Low-latency PCM playback with per-player control.
//!
//! Open one [`Context`] per process with a fixed sample rate, channel count,
//! and input sample format, then create any number of independent
//! [`Player`]s, each reading little-endian interleaved PCM from a byte
//! [`Source`]. All playing players are mixed in real time into a single
//! `f32` stream delivered to the default output device.
//!
//! ## Pipeline
//! 1. **Feed**: a background thread pulls bytes from each player's source
//!    into that player's bounded ready buffer. Sources may block; a slow
//!    source only ever stalls its own player.
//! 2. **Mix**: the backend's real-time callback drains the ready buffers of
//!    all playing players, decodes samples to `f32`, applies per-player
//!    volume, and sums the contributions.
//! 3. **Output**: mixed samples are converted to the device sample format
//!    and handed to the OS through cpal.
//!
//! Play, pause, seek, volume, and close are safe to call from any thread
//! while the stream is running.
//!
//! ```no_run
//! use std::io::Cursor;
//! use audio_mux::{Context, ContextConfig, SampleFormat};
//!
//! # fn main() -> audio_mux::Result<()> {
//! let (ctx, ready) = Context::new(ContextConfig::new(48_000, 2, SampleFormat::S16Le))?;
//! ready.wait();
//!
//! let pcm: Vec<u8> = vec![0; 48_000 * 4]; // one second of silence
//! let player = ctx.new_player(Cursor::new(pcm));
//! player.play();
//! # Ok(())
//! # }
//! ```

mod backend;
mod context;
mod error;
mod format;
pub mod mux;
mod player;
mod source;

#[cfg(test)]
mod testutil;

pub use backend::Ready;
pub use context::{Context, ContextConfig};
pub use error::{Error, Result};
pub use format::{SampleFormat, StreamParams};
pub use mux::Mux;
pub use player::Player;
pub use source::{ReadOnlySource, Source};
