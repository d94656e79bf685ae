//! A single playback unit: one byte source, one bounded ready buffer.
//!
//! ## Design
//! - All mutable state lives behind one mutex ([`PlayerInner`]); the terminal
//!   error additionally sits in a write-once cell so [`Player::err`] never
//!   has to take the lock.
//! - `play()` pre-fills the ready buffer synchronously so the first mix
//!   cycles cannot underrun even with a slow source.
//! - The mux's feeder thread tops the buffer up between mix cycles via
//!   [`PlayerCore::refill_once`]; the real-time mixer drains it via
//!   [`PlayerCore::mix_into`]. Both serialize on the player mutex, so a
//!   blocking source stalls only its own player.
//!
//! State machine: Paused (initial) ⇄ Playing, with Closed as the absorbing
//! terminal state. A source EOF with an empty buffer moves Playing back to
//! Paused on the next mix (natural end of stream).

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::error::{Error, Result};
use crate::format::{self, SampleFormat, StreamParams};
use crate::mux::Mux;
use crate::source::Source;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Paused,
    Playing,
    Closed,
}

/// Lock-protected mutable state of one player.
struct PlayerInner {
    src: Box<dyn Source>,
    state: State,
    volume: f32,
    /// Bytes read from the source, not yet consumed by the mixer.
    ready: VecDeque<u8>,
    /// Read staging area; empty until first used, discarded on buffer resize.
    scratch: Vec<u8>,
    eof: bool,
    buffer_size: usize,
}

pub(crate) struct PlayerCore {
    mux: Weak<Mux>,
    params: StreamParams,
    inner: Mutex<PlayerInner>,
    err: OnceLock<Error>,
}

impl PlayerCore {
    pub(crate) fn new(mux: Weak<Mux>, params: StreamParams, src: Box<dyn Source>) -> Arc<Self> {
        Arc::new(Self {
            mux,
            params,
            inner: Mutex::new(PlayerInner {
                src,
                state: State::Paused,
                volume: 1.0,
                ready: VecDeque::new(),
                scratch: Vec::new(),
                eof: false,
                buffer_size: params.default_buffer_size(),
            }),
            err: OnceLock::new(),
        })
    }

    /// Read from the source until the ready buffer is full, EOF, or the
    /// source reports it has no data yet.
    fn prefill(g: &mut PlayerInner) -> Result<()> {
        if g.scratch.is_empty() {
            g.scratch = vec![0; g.buffer_size];
        }
        let PlayerInner {
            src,
            ready,
            scratch,
            buffer_size,
            eof,
            ..
        } = g;
        while ready.len() < *buffer_size {
            let want = (*buffer_size - ready.len()).min(scratch.len());
            match src.read(&mut scratch[..want]) {
                Ok(0) => {
                    *eof = true;
                    break;
                }
                Ok(n) => ready.extend(scratch[..n].iter().copied()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::SourceRead(e.to_string())),
            }
        }
        Ok(())
    }

    pub(crate) fn play(self: &Arc<Self>) {
        let failed;
        {
            let mut g = self.inner.lock().unwrap();
            if self.err.get().is_some() || g.state != State::Paused {
                return;
            }
            let mut result = Ok(());
            if !g.eof {
                result = Self::prefill(&mut g);
            }
            match result {
                Ok(()) => {
                    g.state = State::Playing;
                    failed = None;
                }
                Err(e) => failed = Some(e),
            }
        }
        match failed {
            Some(e) => self.fail(e),
            None => self.wake_feeder(),
        }
    }

    pub(crate) fn pause(&self) {
        let mut g = self.inner.lock().unwrap();
        if g.state == State::Playing {
            g.state = State::Paused;
        }
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().state == State::Playing
    }

    pub(crate) fn reset(self: &Arc<Self>) {
        {
            let mut g = self.inner.lock().unwrap();
            if g.state == State::Closed {
                return;
            }
            g.state = State::Paused;
            g.ready.clear();
            g.eof = false;
        }
        self.wake_feeder();
    }

    pub(crate) fn seek(self: &Arc<Self>, pos: SeekFrom) -> Result<u64> {
        let outcome;
        {
            let mut g = self.inner.lock().unwrap();
            if g.state == State::Closed {
                return Err(self
                    .err
                    .get()
                    .cloned()
                    .unwrap_or_else(|| Error::SourceSeek("player is closed".to_string())));
            }
            if !g.src.is_seekable() {
                return Err(Error::SourceSeekUnsupported);
            }
            let was_playing = g.state == State::Playing;
            g.state = State::Paused;
            g.ready.clear();
            g.eof = false;
            outcome = match g.src.seek(pos) {
                Ok(new_pos) => {
                    if was_playing {
                        match Self::prefill(&mut g) {
                            Ok(()) => {
                                g.state = State::Playing;
                                Ok(new_pos)
                            }
                            Err(e) => Err(e),
                        }
                    } else {
                        Ok(new_pos)
                    }
                }
                Err(e) => Err(Error::SourceSeek(e.to_string())),
            };
        }
        match outcome {
            Ok(new_pos) => {
                self.wake_feeder();
                Ok(new_pos)
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    pub(crate) fn volume(&self) -> f32 {
        self.inner.lock().unwrap().volume
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.inner.lock().unwrap().volume = volume;
    }

    pub(crate) fn unplayed_buffer_size(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    pub(crate) fn set_buffer_size(self: &Arc<Self>, size: usize) {
        {
            let mut g = self.inner.lock().unwrap();
            if g.state == State::Closed {
                return;
            }
            let mut new_size = if size == 0 {
                self.params.default_buffer_size()
            } else {
                self.params.align_buffer_size(size)
            };
            if new_size == 0 {
                new_size = self.params.default_buffer_size();
            }
            if new_size != g.buffer_size {
                g.buffer_size = new_size;
                g.scratch = Vec::new();
            }
        }
        self.wake_feeder();
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.err.get().cloned()
    }

    pub(crate) fn close(self: &Arc<Self>) -> Result<()> {
        self.unregister();
        {
            let mut g = self.inner.lock().unwrap();
            if g.state != State::Closed {
                g.state = State::Closed;
                g.ready = VecDeque::new();
                g.scratch = Vec::new();
            }
        }
        match self.err.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Whether the feeder should attempt a source read for this player.
    pub(crate) fn can_refill(&self) -> bool {
        if self.err.get().is_some() {
            return false;
        }
        let g = self.inner.lock().unwrap();
        g.state != State::Closed && !g.eof && g.ready.len() < g.buffer_size
    }

    /// Perform at most one source read into the ready buffer.
    ///
    /// Returns the number of bytes transferred. The read is capped at the
    /// buffer's remaining capacity, so `ready.len() <= buffer_size` holds at
    /// all times. May block for as long as the source blocks.
    pub(crate) fn refill_once(self: &Arc<Self>) -> usize {
        let mut failed = None;
        let mut transferred = 0;
        {
            let mut g = self.inner.lock().unwrap();
            if g.state == State::Closed || self.err.get().is_some() || g.eof {
                return 0;
            }
            if g.ready.len() >= g.buffer_size {
                return 0;
            }
            if g.scratch.is_empty() {
                g.scratch = vec![0; g.buffer_size];
            }
            let PlayerInner {
                src,
                ready,
                scratch,
                buffer_size,
                eof,
                state,
                ..
            } = &mut *g;
            let want = (*buffer_size - ready.len()).min(scratch.len());
            match src.read(&mut scratch[..want]) {
                Ok(0) => {
                    *eof = true;
                    if ready.is_empty() && *state == State::Playing {
                        *state = State::Paused;
                    }
                }
                Ok(n) => {
                    ready.extend(scratch[..n].iter().copied());
                    transferred = n;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => failed = Some(Error::SourceRead(e.to_string())),
            }
        }
        if let Some(e) = failed {
            self.fail(e);
        }
        transferred
    }

    /// Decode and add this player's contribution into `out`.
    ///
    /// Consumes whole samples only; drained bytes leave the front of the
    /// ready buffer. Runs on the real-time thread: no allocation, no I/O.
    pub(crate) fn mix_into(&self, out: &mut [f32]) -> usize {
        let mut g = self.inner.lock().unwrap();
        if g.state != State::Playing {
            return 0;
        }
        let bytes_per_sample = self.params.format().bytes_per_sample();
        let n = (g.ready.len() / bytes_per_sample).min(out.len());
        let volume = g.volume;
        match self.params.format() {
            SampleFormat::U8 => {
                for (i, slot) in out[..n].iter_mut().enumerate() {
                    *slot += format::decode_u8(g.ready[i]) * volume;
                }
            }
            SampleFormat::S16Le => {
                for (i, slot) in out[..n].iter_mut().enumerate() {
                    *slot += format::decode_s16le(g.ready[2 * i], g.ready[2 * i + 1]) * volume;
                }
            }
            SampleFormat::F32Le => {
                for (i, slot) in out[..n].iter_mut().enumerate() {
                    let bytes = [
                        g.ready[4 * i],
                        g.ready[4 * i + 1],
                        g.ready[4 * i + 2],
                        g.ready[4 * i + 3],
                    ];
                    *slot += format::decode_f32le(bytes) * volume;
                }
            }
        }
        g.ready.drain(..n * bytes_per_sample);
        if g.eof && g.ready.is_empty() && g.state == State::Playing {
            g.state = State::Paused;
        }
        n
    }

    /// Record a terminal error and close the player. Must be called without
    /// the player lock held.
    fn fail(self: &Arc<Self>, err: Error) {
        tracing::warn!(error = %err, "closing player on terminal error");
        {
            let mut g = self.inner.lock().unwrap();
            let _ = self.err.set(err);
            if g.state != State::Closed {
                g.state = State::Closed;
                g.ready = VecDeque::new();
                g.scratch = Vec::new();
            }
        }
        self.unregister();
    }

    fn unregister(self: &Arc<Self>) {
        if let Some(mux) = self.mux.upgrade() {
            mux.remove(self);
        }
    }

    fn wake_feeder(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.wake_feeder();
        }
    }
}

/// An independent playback unit created by [`Context::new_player`] or
/// [`Mux::new_player`].
///
/// Players start paused. `play()` pre-fills the internal buffer from the
/// source and starts contributing to the mixed output; `pause()` stops the
/// contribution without discarding buffered data. Dropping a player closes
/// it.
///
/// [`Context::new_player`]: crate::Context::new_player
/// [`Mux::new_player`]: crate::Mux::new_player
pub struct Player {
    pub(crate) core: Arc<PlayerCore>,
}

impl Player {
    /// Start playback.
    ///
    /// Pre-fills the ready buffer from the source before the player enters
    /// the playing state. Source errors are not returned here; they are
    /// recorded and visible through [`Player::err`]. No-op on a playing or
    /// closed player.
    pub fn play(&self) {
        self.core.play();
    }

    /// Pause playback. Buffered data is kept. No-op unless playing.
    pub fn pause(&self) {
        self.core.pause();
    }

    pub fn is_playing(&self) -> bool {
        self.core.is_playing()
    }

    /// Pause and discard all buffered data, clearing any end-of-stream
    /// condition. The source position is not touched.
    pub fn reset(&self) {
        self.core.reset();
    }

    /// Seek the underlying source, discarding buffered data.
    ///
    /// If the player was playing it keeps playing from the new position.
    /// Returns [`Error::SourceSeekUnsupported`] (leaving the player
    /// untouched) when the source cannot seek.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        self.core.seek(pos)
    }

    /// Current volume, 1.0 by default.
    pub fn volume(&self) -> f32 {
        self.core.volume()
    }

    /// Set the linear gain applied at mix time. The nominal range is
    /// [0.0, 1.0]; values outside it are not clamped.
    pub fn set_volume(&self, volume: f32) {
        self.core.set_volume(volume);
    }

    /// Bytes buffered from the source but not yet consumed by the mixer.
    pub fn unplayed_buffer_size(&self) -> usize {
        self.core.unplayed_buffer_size()
    }

    /// Change the ready-buffer capacity in bytes.
    ///
    /// 0 restores the context default; other values are rounded down to a
    /// whole number of frames. Already-buffered data is kept.
    pub fn set_buffer_size(&self, size: usize) {
        self.core.set_buffer_size(size);
    }

    /// First terminal error observed by this player, if any.
    pub fn err(&self) -> Option<Error> {
        self.core.error()
    }

    /// Close the player, releasing its buffers and unregistering it from the
    /// mux. Idempotent; returns the terminal error if one was recorded.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Mux;
    use crate::testutil::{s16_bytes, wait_for, ScriptedSource, Step};
    use std::io::Cursor;

    fn mono_s16() -> Arc<Mux> {
        Mux::new(StreamParams::new(8_000, 1, SampleFormat::S16Le).unwrap())
    }

    fn stereo_s16() -> Arc<Mux> {
        Mux::new(StreamParams::new(8_000, 2, SampleFormat::S16Le).unwrap())
    }

    #[test]
    fn play_prefills_and_enters_playing() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(s16_bytes(&[1, 2, 3, 4])));

        assert!(!player.is_playing());
        assert_eq!(player.unplayed_buffer_size(), 0);

        player.play();
        assert!(player.is_playing());
        assert_eq!(player.unplayed_buffer_size(), 8);
        mux.shutdown();
    }

    #[test]
    fn play_and_pause_are_idempotent() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(s16_bytes(&[7; 16])));

        player.play();
        player.play();
        assert!(player.is_playing());
        assert_eq!(player.unplayed_buffer_size(), 32);

        player.pause();
        player.pause();
        assert!(!player.is_playing());
        assert_eq!(player.unplayed_buffer_size(), 32);
        mux.shutdown();
    }

    #[test]
    fn reset_drains_and_pauses() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(s16_bytes(&[5; 8])));

        player.play();
        assert!(player.is_playing());

        player.reset();
        assert!(!player.is_playing());
        assert_eq!(player.unplayed_buffer_size(), 0);
        mux.shutdown();
    }

    #[test]
    fn prefill_stops_at_buffer_size() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(vec![0u8; 20_000]));

        player.play();
        // default for 8 kHz mono s16 is half a second = 8000 bytes
        assert_eq!(player.unplayed_buffer_size(), 8_000);
        mux.shutdown();
    }

    #[test]
    fn set_buffer_size_rounds_down_to_frames() {
        let mux = stereo_s16();
        let player = mux.new_player(Cursor::new(vec![0u8; 64]));

        player.set_buffer_size(10);
        player.play();
        assert_eq!(player.unplayed_buffer_size(), 8);
        mux.shutdown();
    }

    #[test]
    fn set_buffer_size_zero_restores_default() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(vec![0u8; 20_000]));

        player.set_buffer_size(16);
        player.set_buffer_size(0);
        player.play();
        assert_eq!(player.unplayed_buffer_size(), 8_000);
        mux.shutdown();
    }

    #[test]
    fn volume_round_trips_without_clamping() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(Vec::new()));

        assert_eq!(player.volume(), 1.0);
        player.set_volume(0.25);
        assert_eq!(player.volume(), 0.25);
        player.set_volume(1.5);
        assert_eq!(player.volume(), 1.5);
        mux.shutdown();
    }

    #[test]
    fn seek_on_unseekable_source_leaves_state_unchanged() {
        let mux = mono_s16();
        let player = mux.new_player(ScriptedSource::new([Step::Data(s16_bytes(&[1, 2]))]));

        player.play();
        let before = player.unplayed_buffer_size();

        let err = player.seek(SeekFrom::Start(0)).unwrap_err();
        assert_eq!(err, Error::SourceSeekUnsupported);
        assert!(player.is_playing());
        assert_eq!(player.unplayed_buffer_size(), before);
        assert!(player.err().is_none());
        mux.shutdown();
    }

    #[test]
    fn seek_restarts_playback_from_new_offset() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(s16_bytes(&[10, 20, 30, 40])));

        player.play();
        assert!(player.is_playing());

        let pos = player.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(pos, 4);
        assert!(player.is_playing());
        // buffer was discarded and re-filled from byte offset 4
        assert_eq!(player.unplayed_buffer_size(), 4);
        mux.shutdown();
    }

    #[test]
    fn source_error_during_play_closes_player() {
        let mux = mono_s16();
        let player = mux.new_player(ScriptedSource::new([Step::Error("disk".to_string())]));

        player.play();
        assert!(!player.is_playing());
        match player.err() {
            Some(Error::SourceRead(msg)) => assert!(msg.contains("disk")),
            other => panic!("unexpected error state: {other:?}"),
        }
        // closed is absorbing
        player.play();
        assert!(!player.is_playing());
        assert!(matches!(player.close(), Err(Error::SourceRead(_))));
        mux.shutdown();
    }

    #[test]
    fn feeder_refills_after_would_block() {
        let mux = mono_s16();
        let player = mux.new_player(ScriptedSource::new([
            Step::Data(s16_bytes(&[1])),
            Step::WouldBlock,
            Step::Data(s16_bytes(&[2])),
        ]));

        player.play();
        assert!(player.is_playing());
        assert!(wait_for(|| player.unplayed_buffer_size() == 4));
        mux.shutdown();
    }

    #[test]
    fn close_is_idempotent_and_unregisters() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(Vec::new()));
        assert_eq!(mux.player_count(), 1);

        assert!(player.close().is_ok());
        assert!(player.close().is_ok());
        assert_eq!(mux.player_count(), 0);
        assert!(!player.is_playing());
        mux.shutdown();
    }

    #[test]
    fn drop_closes_the_player() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(Vec::new()));
        assert_eq!(mux.player_count(), 1);

        drop(player);
        assert_eq!(mux.player_count(), 0);
        mux.shutdown();
    }

    #[test]
    fn operations_on_closed_player_are_noops() {
        let mux = mono_s16();
        let player = mux.new_player(Cursor::new(s16_bytes(&[1, 2, 3, 4])));
        player.close().unwrap();

        player.play();
        assert!(!player.is_playing());
        player.reset();
        player.set_buffer_size(8);
        assert_eq!(player.unplayed_buffer_size(), 0);
        assert!(matches!(
            player.seek(SeekFrom::Start(0)),
            Err(Error::SourceSeek(_))
        ));
        mux.shutdown();
    }
}
