//! The process-wide audio context.
//!
//! A [`Context`] owns the mux, the feeder, and the output backend. All
//! players created from it share one sample rate, channel count, and input
//! sample format. At most one context may be live per process; dropping it
//! closes every player and stops the audio stream, freeing the slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, Ready};
use crate::error::{Error, Result};
use crate::format::{SampleFormat, StreamParams};
use crate::mux::Mux;
use crate::player::Player;
use crate::source::Source;

static CONTEXT_ACTIVE: AtomicBool = AtomicBool::new(false);

fn claim_context_slot() -> Result<()> {
    if CONTEXT_ACTIVE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(Error::ContextAlreadyExists);
    }
    Ok(())
}

fn release_context_slot() {
    CONTEXT_ACTIVE.store(false, Ordering::SeqCst);
}

/// Configuration for [`Context::new`].
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Samples per second per channel, typically 44100 or 48000.
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channel_count: usize,
    /// Sample encoding of the byte streams players will read.
    pub sample_format: SampleFormat,
    /// Requested device buffer duration. Smaller values lower latency at the
    /// cost of underrun resistance; `None` keeps the device default.
    pub device_buffer: Option<Duration>,
}

impl ContextConfig {
    pub fn new(sample_rate: u32, channel_count: usize, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channel_count,
            sample_format,
            device_buffer: None,
        }
    }

    pub fn with_device_buffer(mut self, target: Duration) -> Self {
        self.device_buffer = Some(target);
        self
    }
}

/// The main entry point: creates players and owns the output stream.
pub struct Context {
    mux: Arc<Mux>,
    backend: Backend,
    params: StreamParams,
}

impl Context {
    /// Open the audio context and start the output stream.
    ///
    /// Returns the context together with a [`Ready`] signal that fires when
    /// the backend produces its first callback (some platforms need user
    /// interaction first); construction itself never waits for that.
    ///
    /// Fails with [`Error::ContextAlreadyExists`] while another context is
    /// live in this process.
    pub fn new(config: ContextConfig) -> Result<(Context, Ready)> {
        let params = StreamParams::new(
            config.sample_rate,
            config.channel_count,
            config.sample_format,
        )?;
        claim_context_slot()?;

        let mux = Mux::new(params);
        match Backend::start(params, config.device_buffer, mux.clone()) {
            Ok((backend, ready)) => Ok((
                Context {
                    mux,
                    backend,
                    params,
                },
                ready,
            )),
            Err(e) => {
                mux.shutdown();
                release_context_slot();
                Err(e)
            }
        }
    }

    /// Create a player reading PCM bytes from `source`.
    ///
    /// The player starts paused and owns the source from here on.
    pub fn new_player(&self, source: impl Source) -> Player {
        self.mux.new_player(source)
    }

    /// Suspend the entire audio output. No mixing happens while suspended.
    pub fn suspend(&self) -> Result<()> {
        if let Some(e) = self.backend.err() {
            return Err(e);
        }
        self.backend.suspend()
    }

    /// Resume audio output previously stopped by [`Context::suspend`].
    pub fn resume(&self) -> Result<()> {
        if let Some(e) = self.backend.err() {
            return Err(e);
        }
        self.backend.resume()
    }

    /// First terminal backend error, if any.
    pub fn err(&self) -> Option<Error> {
        self.backend.err()
    }

    pub fn sample_rate(&self) -> u32 {
        self.params.sample_rate()
    }

    pub fn channel_count(&self) -> usize {
        self.params.channel_count()
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.params.format()
    }

    /// Default per-player ready-buffer size in bytes (half a second of
    /// audio, frame-aligned).
    pub fn default_buffer_size(&self) -> usize {
        self.params.default_buffer_size()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.mux.close_all_players();
        self.backend.shutdown();
        self.mux.shutdown();
        release_context_slot();
    }
}
