//! Low-level multiplexer of audio players.
//!
//! The mux owns the set of live players and does two jobs:
//! - [`Mux::fill_float32`] mixes every playing player's buffered PCM into a
//!   caller-provided `f32` slice. The output backend calls this from its
//!   real-time callback, so the path allocates nothing and never touches
//!   source I/O.
//! - A background *feeder* thread moves bytes from player sources into the
//!   players' ready buffers whenever capacity exists, sleeping on a condvar
//!   when there is nothing to do.
//!
//! Locking: the set lock (player list + wake flag) and the per-player locks
//! are never held together. Both the mixer and the feeder snapshot player
//! handles under the set lock, release it, and then work through the
//! snapshot with only per-player locks. Most users drive this indirectly
//! through [`Context`](crate::Context); the mux is public for tests and
//! custom backends.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::format::StreamParams;
use crate::player::{Player, PlayerCore};
use crate::source::Source;

/// Back-off between feeder passes when every source reported "no data yet".
const IDLE_READ_BACKOFF: Duration = Duration::from_millis(1);

struct MuxInner {
    players: Vec<Arc<PlayerCore>>,
    /// Set when player state changed in a way that may give the feeder work.
    wake: bool,
    shutdown: bool,
}

pub struct Mux {
    params: StreamParams,
    inner: Mutex<MuxInner>,
    feeder_signal: Condvar,
    /// Reusable snapshot buffer for the mixing path.
    mix_players: Mutex<Vec<Arc<PlayerCore>>>,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl Mux {
    /// Create a mux and start its feeder thread.
    pub fn new(params: StreamParams) -> Arc<Self> {
        let mux = Arc::new(Self {
            params,
            inner: Mutex::new(MuxInner {
                players: Vec::new(),
                wake: false,
                shutdown: false,
            }),
            feeder_signal: Condvar::new(),
            mix_players: Mutex::new(Vec::new()),
            feeder: Mutex::new(None),
        });

        let worker = mux.clone();
        let handle = thread::spawn(move || feeder_loop(worker));
        *mux.feeder.lock().unwrap() = Some(handle);

        mux
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// Create a player reading from `source`, registered with this mux in
    /// the paused state.
    pub fn new_player(self: &Arc<Self>, source: impl Source) -> Player {
        let core = PlayerCore::new(Arc::downgrade(self), self.params, Box::new(source));
        self.add(&core);
        Player { core }
    }

    /// Mix all playing players into `out`.
    ///
    /// `out` is zeroed first, then each playing player's buffered samples are
    /// decoded to `f32`, scaled by its volume, and summed in. No clipping and
    /// no normalization by player count is applied. Intended to be called
    /// from the backend's real-time callback.
    pub fn fill_float32(&self, out: &mut [f32]) {
        let mut players = self.mix_players.lock().unwrap();
        {
            let g = self.inner.lock().unwrap();
            players.clear();
            players.extend(g.players.iter().cloned());
        }

        out.fill(0.0);
        for p in players.iter() {
            p.mix_into(out);
        }
        players.clear();
        drop(players);

        // Mixing freed buffer capacity; let the feeder top the players up.
        self.wake_feeder();
    }

    /// Stop the feeder thread and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut g = self.inner.lock().unwrap();
            if g.shutdown {
                return;
            }
            g.shutdown = true;
        }
        self.feeder_signal.notify_all();

        let handle = self.feeder.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn add(&self, player: &Arc<PlayerCore>) {
        {
            let mut g = self.inner.lock().unwrap();
            g.players.push(player.clone());
            g.wake = true;
        }
        self.feeder_signal.notify_all();
    }

    pub(crate) fn remove(&self, player: &Arc<PlayerCore>) {
        {
            let mut g = self.inner.lock().unwrap();
            g.players.retain(|p| !Arc::ptr_eq(p, player));
            g.wake = true;
        }
        self.feeder_signal.notify_all();
    }

    pub(crate) fn wake_feeder(&self) {
        {
            let mut g = self.inner.lock().unwrap();
            g.wake = true;
        }
        self.feeder_signal.notify_all();
    }

    /// Close every registered player (used when the owning context drops).
    pub(crate) fn close_all_players(&self) {
        let players: Vec<Arc<PlayerCore>> = self.inner.lock().unwrap().players.clone();
        for p in &players {
            let _ = p.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn player_count(&self) -> usize {
        self.inner.lock().unwrap().players.len()
    }
}

/// Feeder: pull bytes from player sources into their ready buffers.
///
/// Sleeps on the condvar until something may have created work (a player was
/// added, started, reset, resized, or the mixer drained buffers). Sources
/// that legitimately return no data keep the pass alive through a 1 ms
/// back-off instead of a busy loop.
fn feeder_loop(mux: Arc<Mux>) {
    let mut snapshot: Vec<Arc<PlayerCore>> = Vec::new();
    loop {
        {
            let mut g = mux.inner.lock().unwrap();
            while !g.wake && !g.shutdown {
                g = mux.feeder_signal.wait(g).unwrap();
            }
            if g.shutdown {
                return;
            }
            g.wake = false;
            snapshot.clear();
            snapshot.extend(g.players.iter().cloned());
        }

        let mut any_read = false;
        for p in &snapshot {
            if !p.can_refill() {
                continue;
            }
            if p.refill_once() > 0 {
                any_read = true;
            }
        }

        // Keep going while capacity remains; back off when all reads came up
        // empty so non-blocking sources don't spin us.
        if snapshot.iter().any(|p| p.can_refill()) {
            if !any_read {
                thread::sleep(IDLE_READ_BACKOFF);
            }
            mux.inner.lock().unwrap().wake = true;
        }
        snapshot.clear();
    }
}
