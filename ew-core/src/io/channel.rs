//! Queue-fed byte source
//!
//! Bytes pushed into a [`ChannelSink`] from any thread come out of the
//! paired [`ChannelSource`] as a non-blocking stream. The fusion loop only
//! ever calls `try_recv`, so it never waits.

use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

/// Sending half handed to whatever produces the bytes
pub type ChannelSink = Sender<Vec<u8>>;

/// Non-blocking reader over a byte-chunk channel.
///
/// No chunk pending reads as `WouldBlock`; every sender dropped and the
/// queue drained reads as `Ok(0)`.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

/// Paired sink and source
pub fn channel() -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel();
    (tx, ChannelSource::new(rx))
}

impl ChannelSource {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }

    fn copy_pending(&mut self, buf: &mut [u8]) -> usize {
        let remaining = &self.pending[self.offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        if self.offset == self.pending.len() {
            self.pending.clear();
            self.offset = 0;
        }
        n
    }
}

impl Read for ChannelSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.offset < self.pending.len() {
                return Ok(self.copy_pending(buf));
            }
            match self.rx.try_recv() {
                // Empty chunks would otherwise read as EOF
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(TryRecvError::Empty) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(TryRecvError::Disconnected) => return Ok(0),
            }
        }
    }
}
