//! cpal output backend.
//!
//! A dedicated thread owns the `cpal::Stream` (streams are not `Send`) and
//! serves suspend/resume/shutdown commands over a channel. The stream's data
//! callback pulls mixed `f32` samples from the [`Mux`] and converts them to
//! the device sample format; the error callback forwards stream faults back
//! to the backend thread.
//!
//! ## Failure policy
//! - "Device not available" is treated as temporary: the stream is rebuilt
//!   against the (possibly new) default device, retrying on the back-off
//!   ladder until it opens or shutdown is requested.
//! - Other start/stop failures (e.g. a recording session still holding the
//!   device) retry on the ladder {10, 20, 50, 100, 100, ...} ms, at most
//!   100 attempts, then surface as the context-wide terminal error.

use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::format::StreamParams;
use crate::mux::Mux;

const BACKOFF: [Duration; 4] = [
    Duration::from_millis(10),
    Duration::from_millis(20),
    Duration::from_millis(50),
    Duration::from_millis(100),
];

const MAX_ATTEMPTS: usize = 100;

fn backoff_delay(attempt: usize) -> Duration {
    BACKOFF[attempt.min(BACKOFF.len() - 1)]
}

/// Device buffer size in frames for a requested duration.
fn hint_frames(sample_rate: u32, target: Duration) -> u32 {
    ((sample_rate as f64 * target.as_secs_f64()).round() as u32).max(1)
}

enum Command {
    Suspend(Sender<Result<()>>),
    Resume(Sender<Result<()>>),
    Shutdown,
}

/// One-shot signal that fires once the backend has produced its first audio
/// callback.
///
/// Some platforms only deliver audio after user interaction, so context
/// construction returns before this fires. `wait` also returns if the
/// backend shuts down without ever running a callback.
pub struct Ready {
    rx: Receiver<()>,
}

impl Ready {
    /// Block until the first callback has run.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Non-blocking probe.
    pub fn is_ready(&self) -> bool {
        match self.rx.try_recv() {
            Ok(()) => true,
            Err(crossbeam_channel::TryRecvError::Empty) => false,
            Err(crossbeam_channel::TryRecvError::Disconnected) => true,
        }
    }
}

pub(crate) struct Backend {
    cmd_tx: Sender<Command>,
    err: Arc<OnceLock<Error>>,
    thread: Option<JoinHandle<()>>,
}

impl Backend {
    /// Spawn the backend thread and open the output stream.
    ///
    /// Returns once stream construction has succeeded or failed; never waits
    /// for the first callback.
    pub(crate) fn start(
        params: StreamParams,
        device_buffer: Option<Duration>,
        mux: Arc<Mux>,
    ) -> Result<(Backend, Ready)> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (init_tx, init_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);
        let err = Arc::new(OnceLock::new());
        let thread_err = err.clone();

        let thread = thread::spawn(move || {
            run(params, device_buffer, mux, cmd_rx, init_tx, ready_tx, thread_err);
        });

        match init_rx.recv() {
            Ok(Ok(())) => Ok((
                Backend {
                    cmd_tx,
                    err,
                    thread: Some(thread),
                },
                Ready { rx: ready_rx },
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::BackendInit(
                    "backend thread exited during startup".to_string(),
                ))
            }
        }
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        self.request(Command::Suspend)
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.request(Command::Resume)
    }

    pub(crate) fn err(&self) -> Option<Error> {
        self.err.get().cloned()
    }

    fn request(&self, make: impl FnOnce(Sender<Result<()>>) -> Command) -> Result<()> {
        let (tx, rx) = bounded(1);
        if self.cmd_tx.send(make(tx)).is_err() {
            return Err(self.terminal());
        }
        match rx.recv() {
            Ok(res) => res,
            Err(_) => Err(self.terminal()),
        }
    }

    fn terminal(&self) -> Error {
        self.err
            .get()
            .cloned()
            .unwrap_or_else(|| Error::BackendRuntime("audio backend thread is gone".to_string()))
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    params: StreamParams,
    device_buffer: Option<Duration>,
    mux: Arc<Mux>,
    cmd_rx: Receiver<Command>,
    init_tx: Sender<Result<()>>,
    ready_tx: Sender<()>,
    err: Arc<OnceLock<Error>>,
) {
    let (fault_tx, fault_rx) = unbounded();

    let mut stream = match open_stream(&params, device_buffer, &mux, &fault_tx, Some(ready_tx)) {
        Ok(s) => {
            let _ = init_tx.send(Ok(()));
            s
        }
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let mut suspended = false;

    loop {
        select! {
            recv(cmd_rx) -> msg => match msg {
                Ok(Command::Suspend(reply)) => {
                    let res = match pause_with_retry(&stream) {
                        Ok(()) => {
                            suspended = true;
                            Ok(())
                        }
                        Err(cpal::PauseStreamError::DeviceNotAvailable) => {
                            match rebuild_stream(&params, device_buffer, &mux, &fault_tx, &cmd_rx) {
                                Some(new_stream) => {
                                    stream = new_stream;
                                    let res = pause_with_retry(&stream).map_err(|e| {
                                        Error::BackendRuntime(format!(
                                            "failed to suspend output stream: {e}"
                                        ))
                                    });
                                    if res.is_ok() {
                                        suspended = true;
                                    }
                                    res
                                }
                                None => {
                                    let _ = reply.send(Err(Error::BackendRuntime(
                                        "backend shut down during stream rebuild".to_string(),
                                    )));
                                    return;
                                }
                            }
                        }
                        Err(e) => Err(Error::BackendRuntime(format!(
                            "failed to suspend output stream: {e}"
                        ))),
                    };
                    let _ = reply.send(res);
                }
                Ok(Command::Resume(reply)) => {
                    let res = match resume_with_retry(&stream) {
                        Ok(()) => {
                            suspended = false;
                            Ok(())
                        }
                        Err(cpal::PlayStreamError::DeviceNotAvailable) => {
                            match rebuild_stream(&params, device_buffer, &mux, &fault_tx, &cmd_rx) {
                                Some(new_stream) => {
                                    stream = new_stream;
                                    suspended = false;
                                    Ok(())
                                }
                                None => {
                                    let _ = reply.send(Err(Error::BackendRuntime(
                                        "backend shut down during stream rebuild".to_string(),
                                    )));
                                    return;
                                }
                            }
                        }
                        Err(e) => Err(Error::BackendRuntime(format!(
                            "failed to resume output stream: {e}"
                        ))),
                    };
                    let _ = reply.send(res);
                }
                Ok(Command::Shutdown) | Err(_) => return,
            },
            recv(fault_rx) -> fault => match fault {
                Ok(cpal::StreamError::DeviceNotAvailable) => {
                    tracing::warn!("output device lost, rebuilding stream");
                    match rebuild_stream(&params, device_buffer, &mux, &fault_tx, &cmd_rx) {
                        Some(new_stream) => {
                            stream = new_stream;
                            if suspended {
                                let _ = pause_with_retry(&stream);
                            }
                        }
                        None => return,
                    }
                }
                Ok(e) => {
                    let _ = err.set(Error::BackendRuntime(e.to_string()));
                    return;
                }
                Err(_) => {}
            },
        }
    }
}

/// Open the default output device and start a stream feeding from `mux`.
fn open_stream(
    params: &StreamParams,
    device_buffer: Option<Duration>,
    mux: &Arc<Mux>,
    fault_tx: &Sender<cpal::StreamError>,
    ready_tx: Option<Sender<()>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::BackendInit("no default output device".to_string()))?;

    let supported = output_config(&device, params)?;
    let mut config: cpal::StreamConfig = supported.config();
    if let Some(target) = device_buffer {
        config.buffer_size = cpal::BufferSize::Fixed(hint_frames(params.sample_rate(), target));
    }

    tracing::info!(
        rate_hz = config.sample_rate.0,
        channels = config.channels,
        format = ?supported.sample_format(),
        "starting output stream"
    );

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, mux, fault_tx, ready_tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, mux, fault_tx, ready_tx),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, mux, fault_tx, ready_tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, mux, fault_tx, ready_tx),
        other => Err(Error::FormatUnsupported(format!(
            "device sample format {other:?}"
        ))),
    }?;

    resume_with_retry(&stream)
        .map_err(|e| Error::BackendInit(format!("failed to start output stream: {e}")))?;

    Ok(stream)
}

/// Choose a supported config with the context's exact rate and channel
/// count, preferring sample formats that need the least conversion.
fn output_config(
    device: &cpal::Device,
    params: &StreamParams,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| Error::BackendInit(format!("failed to query output configs: {e}")))?;

    let mut best: Option<(u8, cpal::SupportedStreamConfigRange)> = None;
    for range in ranges {
        if range.channels() as usize != params.channel_count() {
            continue;
        }
        if cpal::SampleRate(params.sample_rate()) < range.min_sample_rate()
            || cpal::SampleRate(params.sample_rate()) > range.max_sample_rate()
        {
            continue;
        }
        let rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((best_rank, _)) => rank < *best_rank,
        };
        if replace {
            best = Some((rank, range));
        }
    }

    match best {
        Some((_, range)) => Ok(range.with_sample_rate(cpal::SampleRate(params.sample_rate()))),
        None => Err(Error::FormatUnsupported(format!(
            "device does not support {} Hz {}-channel output",
            params.sample_rate(),
            params.channel_count()
        ))),
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Build the output stream for the device sample format `T`.
///
/// The data callback mixes into a reusable `f32` buffer and converts per
/// sample; for `f32` devices the conversion is the identity.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mux: &Arc<Mux>,
    fault_tx: &Sender<cpal::StreamError>,
    mut ready_tx: Option<Sender<()>>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let mux = mux.clone();
    let fault_tx = fault_tx.clone();
    let err_fn = move |e: cpal::StreamError| {
        tracing::warn!("output stream error: {e}");
        let _ = fault_tx.send(e);
    };

    let mut mix_buf: Vec<f32> = Vec::new();
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
                if mix_buf.len() < data.len() {
                    mix_buf.resize(data.len(), 0.0);
                }
                let mix = &mut mix_buf[..data.len()];
                mux.fill_float32(mix);
                for (dst, v) in data.iter_mut().zip(mix.iter()) {
                    *dst = T::from_sample(*v);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::BackendInit(format!("failed to build output stream: {e}")))?;

    Ok(stream)
}

/// Retry `op` on the back-off ladder, up to [`MAX_ATTEMPTS`].
///
/// Errors classified as device loss by `is_device_lost` are returned
/// immediately: losing the device is a rebuild condition, not something a
/// retry of the same stream can fix.
fn retry_on_ladder<E>(
    is_device_lost: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> std::result::Result<(), E>,
) -> std::result::Result<(), E> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if is_device_lost(&e) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(e);
                }
                thread::sleep(backoff_delay(attempt - 1));
            }
        }
    }
}

fn pause_error_is_device_lost(e: &cpal::PauseStreamError) -> bool {
    matches!(e, cpal::PauseStreamError::DeviceNotAvailable)
}

fn play_error_is_device_lost(e: &cpal::PlayStreamError) -> bool {
    matches!(e, cpal::PlayStreamError::DeviceNotAvailable)
}

fn pause_with_retry(stream: &cpal::Stream) -> std::result::Result<(), cpal::PauseStreamError> {
    retry_on_ladder(pause_error_is_device_lost, || stream.pause())
}

fn resume_with_retry(stream: &cpal::Stream) -> std::result::Result<(), cpal::PlayStreamError> {
    retry_on_ladder(play_error_is_device_lost, || stream.play())
}

/// Recreate the output stream after the device went away.
///
/// Device loss is a temporary condition, so this retries until a stream
/// opens; shutdown stays responsive because the ladder waits happen on the
/// command channel. Returns `None` when shutdown was requested.
fn rebuild_stream(
    params: &StreamParams,
    device_buffer: Option<Duration>,
    mux: &Arc<Mux>,
    fault_tx: &Sender<cpal::StreamError>,
    cmd_rx: &Receiver<Command>,
) -> Option<cpal::Stream> {
    let mut attempt = 0;
    loop {
        match open_stream(params, device_buffer, mux, fault_tx, None) {
            Ok(stream) => {
                tracing::info!("output stream rebuilt");
                return Some(stream);
            }
            Err(e) => {
                tracing::warn!(error = %e, "output stream rebuild failed, retrying");
                attempt += 1;
                match cmd_rx.recv_timeout(backoff_delay(attempt - 1)) {
                    Ok(Command::Shutdown) => return None,
                    Ok(Command::Suspend(reply) | Command::Resume(reply)) => {
                        let _ = reply.send(Err(Error::BackendRuntime(
                            "output stream is being rebuilt".to_string(),
                        )));
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return None,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps_at_100ms() {
        assert_eq!(backoff_delay(0), Duration::from_millis(10));
        assert_eq!(backoff_delay(1), Duration::from_millis(20));
        assert_eq!(backoff_delay(2), Duration::from_millis(50));
        assert_eq!(backoff_delay(3), Duration::from_millis(100));
        assert_eq!(backoff_delay(4), Duration::from_millis(100));
        assert_eq!(backoff_delay(99), Duration::from_millis(100));
    }

    #[test]
    fn hint_frames_converts_duration_to_frames() {
        assert_eq!(hint_frames(48_000, Duration::from_millis(10)), 480);
        assert_eq!(hint_frames(44_100, Duration::from_secs(1)), 44_100);
        assert_eq!(hint_frames(48_000, Duration::from_nanos(1)), 1);
    }

    #[test]
    fn sample_format_rank_prefers_f32() {
        assert!(sample_format_rank(cpal::SampleFormat::F32) < sample_format_rank(cpal::SampleFormat::I32));
        assert!(sample_format_rank(cpal::SampleFormat::I32) < sample_format_rank(cpal::SampleFormat::I16));
        assert!(sample_format_rank(cpal::SampleFormat::I16) < sample_format_rank(cpal::SampleFormat::U16));
    }

    #[test]
    fn pause_device_loss_is_classified_for_rebuild() {
        assert!(pause_error_is_device_lost(
            &cpal::PauseStreamError::DeviceNotAvailable
        ));
        let busy = cpal::PauseStreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "recording session active".to_string(),
            },
        };
        assert!(!pause_error_is_device_lost(&busy));

        assert!(play_error_is_device_lost(
            &cpal::PlayStreamError::DeviceNotAvailable
        ));
    }

    #[test]
    fn retry_on_ladder_returns_device_loss_without_retrying() {
        let mut calls = 0;
        let res: std::result::Result<(), &str> = retry_on_ladder(
            |e| *e == "device lost",
            || {
                calls += 1;
                Err("device lost")
            },
        );
        assert_eq!(res, Err("device lost"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_on_ladder_retries_transient_errors_until_success() {
        let mut calls = 0;
        let res: std::result::Result<(), &str> = retry_on_ladder(
            |_| false,
            || {
                calls += 1;
                if calls < 3 {
                    Err("cannot start playing")
                } else {
                    Ok(())
                }
            },
        );
        assert!(res.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn ready_reports_first_callback() {
        let (tx, rx) = bounded(1);
        let ready = Ready { rx };
        assert!(!ready.is_ready());

        tx.send(()).unwrap();
        drop(tx);
        assert!(ready.is_ready());
        // wait returns immediately once fired
        ready.wait();
    }
}
