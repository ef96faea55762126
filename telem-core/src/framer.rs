//! Per-connection record framer: peek, size, body. One record per connection.

use std::io::{self, ErrorKind, Read};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::protocol::RECORD_SIZE_LEN;

/// A byte stream that can also be inspected without consuming.
pub trait PeekRead: Read {
    /// Non-blocking look at pending bytes. `Ok(0)` means the peer closed.
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bound the next blocking read to `remaining`. Streams that never block need not care.
    fn set_read_deadline(&mut self, remaining: Duration) -> io::Result<()> {
        let _ = remaining;
        Ok(())
    }
}

#[cfg(unix)]
impl PeekRead for std::os::unix::net::UnixStream {
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: `buf` is a valid writable region of `buf.len()` bytes for the whole call
        // and the descriptor is owned by `self`.
        let n = unsafe {
            libc::recv(
                self.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn set_read_deadline(&mut self, remaining: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(remaining))
    }
}

/// Where a connection's framer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    SizePeek,
    SizeRead,
    BodyRead,
    Complete,
    Failed,
}

/// Why a frame could not be read. Affects only the one connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("peer closed after {received} of {expected} bytes")]
    ClosedEarly { expected: usize, received: usize },
    #[error("record size {size} outside (4, {max}]")]
    SizeOutOfRange { size: u32, max: usize },
    #[error("read deadline exceeded after {received} of {expected} bytes")]
    Stalled { expected: usize, received: usize },
}

/// Decode state of one accepted connection.
///
/// The buffer is present only while a record is in flight; `received <= capacity` always.
#[derive(Debug)]
pub struct Connection {
    state: FrameState,
    buf: Option<Vec<u8>>,
    capacity: usize,
    received: usize,
    max_record_size: usize,
    frame_timeout: Option<Duration>,
}

impl Connection {
    pub fn new(max_record_size: usize) -> Self {
        Self {
            state: FrameState::Idle,
            buf: None,
            capacity: 0,
            received: 0,
            max_record_size,
            frame_timeout: None,
        }
    }

    /// Limit the time from the first size byte to the last body byte. `None` waits forever.
    pub fn with_frame_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        self.frame_timeout
    }

    pub fn has_buffer(&self) -> bool {
        self.buf.is_some()
    }

    /// Read exactly one record from `stream`.
    ///
    /// Returns `Ok(None)` when the peer closed without sending anything. Once bytes are
    /// pending this keeps reading the one stream until the body is complete or the read
    /// fails; the frame timeout bounds the whole frame, not each read.
    pub fn read_record<S: PeekRead>(
        &mut self,
        stream: &mut S,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        let res = self.advance(stream);
        if res.is_err() {
            self.state = FrameState::Failed;
            self.buf = None;
        }
        res
    }

    fn advance<S: PeekRead>(&mut self, stream: &mut S) -> Result<Option<Vec<u8>>, FrameError> {
        self.buf = None;

        self.state = FrameState::SizePeek;
        let mut size_buf = [0u8; RECORD_SIZE_LEN];
        let peeked = loop {
            match stream.peek(&mut size_buf) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        if peeked.map_err(FrameError::Transport)? == 0 {
            self.state = FrameState::Complete;
            return Ok(None);
        }

        self.state = FrameState::SizeRead;
        let deadline = self.frame_timeout.map(|t| Instant::now() + t);
        let mut size_read = 0;
        fill(stream, &mut size_buf, &mut size_read, deadline)?;
        let size = u32::from_le_bytes(size_buf);
        if size as usize <= RECORD_SIZE_LEN || size as usize > self.max_record_size {
            return Err(FrameError::SizeOutOfRange {
                size,
                max: self.max_record_size,
            });
        }

        self.capacity = size as usize - RECORD_SIZE_LEN;
        self.received = 0;
        self.state = FrameState::BodyRead;
        let buf = self.buf.insert(alloc_record_buffer(self.capacity));
        debug!(record_size = size, "reading record body");
        fill(stream, buf, &mut self.received, deadline)?;

        self.state = FrameState::Complete;
        Ok(self.buf.take())
    }
}

/// Read into `buf[*filled..]` until it is full, advancing `filled` as bytes land.
fn fill<S: PeekRead>(
    stream: &mut S,
    buf: &mut [u8],
    filled: &mut usize,
    deadline: Option<Instant>,
) -> Result<(), FrameError> {
    let expected = buf.len();
    let stalled = |received| FrameError::Stalled { expected, received };
    while *filled < expected {
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(stalled(*filled));
            }
            stream
                .set_read_deadline(remaining)
                .map_err(FrameError::Transport)?;
        }
        match stream.read(&mut buf[*filled..]) {
            Ok(0) => {
                return Err(FrameError::ClosedEarly {
                    expected,
                    received: *filled,
                })
            }
            Ok(n) => *filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(stalled(*filled))
            }
            Err(e) => return Err(FrameError::Transport(e)),
        }
    }
    Ok(())
}

/// Zeroed buffer of exactly `len` bytes.
///
/// Running out of memory here is not recoverable: the process exits rather than carry
/// on with partial state.
fn alloc_record_buffer(len: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    if buf.try_reserve_exact(len).is_err() {
        error!(len, "unable to allocate record buffer, exiting");
        std::process::exit(1);
    }
    buf.resize(len, 0);
    buf
}
