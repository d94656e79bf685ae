//! Shared test helpers: scripted sources and PCM byte builders.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use crate::source::Source;

/// One scripted outcome for a [`ScriptedSource`] read.
pub(crate) enum Step {
    Data(Vec<u8>),
    WouldBlock,
    Error(String),
}

/// A non-seekable source that replays a fixed script of read outcomes and
/// then reports end of stream.
pub(crate) struct ScriptedSource {
    steps: VecDeque<Step>,
}

impl ScriptedSource {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }
}

impl Read for ScriptedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            None => Ok(0),
            Some(Step::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.steps.push_front(Step::Data(bytes[n..].to_vec()));
                }
                Ok(n)
            }
            Some(Step::WouldBlock) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no data yet"))
            }
            Some(Step::Error(msg)) => Err(io::Error::other(msg)),
        }
    }
}

impl Seek for ScriptedSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "scripted source cannot seek",
        ))
    }
}

impl Source for ScriptedSource {
    fn is_seekable(&self) -> bool {
        false
    }
}

/// Little-endian bytes for a run of signed 16-bit samples.
pub(crate) fn s16_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Little-endian bytes for a run of 32-bit float samples.
pub(crate) fn f32_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Poll `cond` for up to ~100 ms, returning whether it became true.
pub(crate) fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
