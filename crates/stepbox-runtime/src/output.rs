//! Bounded capture of container output.
//!
//! Stdout passes through an [`OutputRouter`] that discards startup noise
//! until the handshake marker is seen, then routes everything into a
//! [`LimitedBuffer`]. Stderr goes straight into its own buffer.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

const READ_CHUNK: usize = 32 * 1024;

/// A byte buffer that refuses to grow past a fixed capacity.
///
/// Once a write would exceed the capacity the fitting prefix is kept, the
/// buffer is flagged as overflowed, and every later write is dropped.
#[derive(Debug)]
pub struct LimitedBuffer {
    data: Vec<u8>,
    capacity: usize,
    overflowed: bool,
}

impl LimitedBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            overflowed: false,
        }
    }

    /// Appends `bytes`, returning `false` once the capacity is exceeded.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if self.overflowed {
            return false;
        }
        let room = self.capacity - self.data.len();
        if bytes.len() > room {
            self.data.extend_from_slice(&bytes[..room]);
            self.overflowed = true;
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    /// Whether more bytes were offered than the capacity allows.
    #[must_use]
    pub const fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The bytes captured so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A [`LimitedBuffer`] shared between a reader task and the container.
#[derive(Debug, Clone)]
pub struct SharedBuffer(Arc<Mutex<LimitedBuffer>>);

impl SharedBuffer {
    /// Creates a shared buffer with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(LimitedBuffer::new(capacity))))
    }

    /// Appends bytes, see [`LimitedBuffer::write`].
    pub fn write(&self, bytes: &[u8]) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(bytes)
    }

    /// Whether the buffer overflowed.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .overflowed()
    }

    /// Copies out the captured bytes.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_bytes()
            .to_vec()
    }
}

#[derive(Debug)]
enum RouteState {
    /// Looking for the marker; holds the tail of everything seen so far.
    Seeking { window: Vec<u8> },
    /// Marker found; every byte goes to the sink.
    Routing,
}

/// Two-state stdout filter around the handshake marker.
///
/// While seeking, only the last `marker.len() - 1` bytes are retained so a
/// marker split across reads is still matched. Bytes up to and including
/// the marker are discarded; the rest is routed to the sink.
#[derive(Debug)]
pub struct OutputRouter {
    marker: &'static [u8],
    state: RouteState,
    sink: SharedBuffer,
    ready: Option<oneshot::Sender<()>>,
}

impl OutputRouter {
    /// Creates a router that signals `ready` once `marker` has been seen.
    #[must_use]
    pub const fn new(
        marker: &'static [u8],
        sink: SharedBuffer,
        ready: oneshot::Sender<()>,
    ) -> Self {
        Self {
            marker,
            state: RouteState::Seeking { window: Vec::new() },
            sink,
            ready: Some(ready),
        }
    }

    /// Whether the marker has been matched.
    #[must_use]
    pub const fn is_routing(&self) -> bool {
        matches!(self.state, RouteState::Routing)
    }

    /// Feeds the next chunk read from stdout.
    pub fn feed(&mut self, chunk: &[u8]) {
        let RouteState::Seeking { window } = &mut self.state else {
            let _ = self.sink.write(chunk);
            return;
        };

        window.extend_from_slice(chunk);
        if let Some(at) = find(window, self.marker) {
            let rest = window.split_off(at + self.marker.len());
            self.state = RouteState::Routing;
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }
            if !rest.is_empty() {
                let _ = self.sink.write(&rest);
            }
            return;
        }

        let keep = self.marker.len().saturating_sub(1);
        if window.len() > keep {
            let _ = window.drain(..window.len() - keep);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads `reader` to EOF, handing every chunk to `sink`.
///
/// Keeps draining after the sink stops accepting bytes so the producer is
/// never blocked on a full pipe. Read errors end the pump.
pub async fn pump<R, F>(mut reader: R, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink(&buf[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

/// Strips contained-process startup spam: everything up to and including
/// `header`. Returns the input unchanged when the header is absent.
#[must_use]
pub fn strip_stderr_header<'a>(stderr: &'a [u8], header: &[u8]) -> &'a [u8] {
    find(stderr, header).map_or(stderr, |at| &stderr[at + header.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &[u8] = b"READY\n";

    fn router() -> (OutputRouter, SharedBuffer, oneshot::Receiver<()>) {
        let sink = SharedBuffer::new(1024);
        let (tx, rx) = oneshot::channel();
        (OutputRouter::new(MARKER, sink.clone(), tx), sink, rx)
    }

    #[test]
    fn limited_buffer_keeps_prefix_on_overflow() {
        let mut buf = LimitedBuffer::new(4);
        assert!(buf.write(b"ab"));
        assert!(!buf.write(b"cdef"));
        assert!(buf.overflowed());
        assert_eq!(buf.as_bytes(), b"abcd");
        assert!(!buf.write(b"g"));
        assert_eq!(buf.as_bytes(), b"abcd");
    }

    #[test]
    fn limited_buffer_exact_fill_is_not_overflow() {
        let mut buf = LimitedBuffer::new(3);
        assert!(buf.write(b"abc"));
        assert!(!buf.overflowed());
        assert!(buf.write(b""));
        assert!(!buf.write(b"d"));
        assert!(buf.overflowed());
    }

    #[test]
    fn router_discards_noise_before_marker() {
        let (mut r, sink, mut rx) = router();
        r.feed(b"pulling image...\nREADY\npayload");
        assert!(r.is_routing());
        assert!(rx.try_recv().is_ok());
        assert_eq!(sink.to_vec(), b"payload");
    }

    #[test]
    fn router_matches_marker_split_across_chunks() {
        let (mut r, sink, mut rx) = router();
        r.feed(b"noiseRE");
        assert!(!r.is_routing());
        r.feed(b"AD");
        r.feed(b"Y\nafter");
        assert!(r.is_routing());
        assert!(rx.try_recv().is_ok());
        assert_eq!(sink.to_vec(), b"after");
    }

    #[test]
    fn router_matches_marker_byte_by_byte() {
        let (mut r, sink, _rx) = router();
        for b in b"xxREADY\nyz" {
            r.feed(std::slice::from_ref(b));
        }
        assert_eq!(sink.to_vec(), b"yz");
    }

    #[test]
    fn router_routes_everything_after_marker_verbatim() {
        let (mut r, sink, _rx) = router();
        r.feed(MARKER);
        assert!(sink.to_vec().is_empty());
        r.feed(b"READY\n");
        assert_eq!(sink.to_vec(), b"READY\n");
    }

    #[test]
    fn router_without_marker_never_routes() {
        let (mut r, sink, mut rx) = router();
        r.feed(b"READ");
        r.feed(b"Y");
        r.feed(b"\r\n");
        assert!(!r.is_routing());
        assert!(rx.try_recv().is_err());
        assert!(sink.to_vec().is_empty());
    }

    #[test]
    fn strip_stderr_header_drops_spam() {
        assert_eq!(strip_stderr_header(b"spam\nHDR\nreal", b"HDR\n"), b"real");
        assert_eq!(strip_stderr_header(b"no header", b"HDR\n"), b"no header");
    }

    #[tokio::test]
    async fn pump_reads_until_eof() {
        let mut seen = Vec::new();
        pump(&b"hello world"[..], |chunk| seen.extend_from_slice(chunk)).await;
        assert_eq!(seen, b"hello world");
    }
}
