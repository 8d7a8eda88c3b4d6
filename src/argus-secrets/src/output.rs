//! Bounded capture of backend output.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Byte sink that stores at most a fixed number of bytes.
///
/// Writes past the cap succeed and are discarded, so the pipe feeding the
/// buffer keeps draining and the backend never blocks on a full pipe just
/// because capture is full. Clones share the same storage; the relay task
/// writes through its clone while the controller reads the original.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    inner: Arc<Mutex<BoundedBufferInner>>,
}

#[derive(Debug)]
struct BoundedBufferInner {
    data: Vec<u8>,
    max_bytes: usize,
    total_written: u64,
}

impl BoundedBuffer {
    /// Create a buffer that stores at most `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoundedBufferInner {
                data: Vec::new(),
                max_bytes,
                total_written: 0,
            })),
        }
    }

    /// Bytes captured so far, at most the configured maximum.
    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .lock()
            .map(|inner| inner.data.clone())
            .unwrap_or_default()
    }

    /// Number of bytes currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.data.len()).unwrap_or(0)
    }

    /// True when nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes offered to the buffer, including discarded ones.
    pub fn total_written(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.total_written)
            .unwrap_or(0)
    }

    /// Whether any bytes were dropped past the cap.
    pub fn truncated(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.total_written > inner.data.len() as u64)
            .unwrap_or(false)
    }
}

impl Write for BoundedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.total_written += buf.len() as u64;
            let room = inner.max_bytes.saturating_sub(inner.data.len());
            let keep = room.min(buf.len());
            if keep > 0 {
                inner.data.extend_from_slice(&buf[..keep]);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_everything_under_the_cap() {
        let mut buffer = BoundedBuffer::new(64);
        buffer.write_all(b"small output").unwrap();
        assert_eq!(buffer.contents(), b"small output");
        assert!(!buffer.truncated());
    }

    #[test]
    fn truncates_to_exactly_the_cap() {
        let mut buffer = BoundedBuffer::new(8);
        buffer.write_all(b"0123456789").unwrap();
        assert_eq!(buffer.contents(), b"01234567");
        assert_eq!(buffer.len(), 8);
        assert!(buffer.truncated());
        assert_eq!(buffer.total_written(), 10);
    }

    #[test]
    fn writes_straddling_the_cap_keep_the_prefix() {
        let mut buffer = BoundedBuffer::new(5);
        buffer.write_all(b"abc").unwrap();
        buffer.write_all(b"defg").unwrap();
        buffer.write_all(b"h").unwrap();
        assert_eq!(buffer.contents(), b"abcde");
        assert_eq!(buffer.total_written(), 8);
    }

    #[test]
    fn zero_cap_discards_everything() {
        let mut buffer = BoundedBuffer::new(0);
        buffer.write_all(b"dropped").unwrap();
        assert!(buffer.is_empty());
        assert!(buffer.truncated());
    }

    #[test]
    fn clones_share_storage() {
        let buffer = BoundedBuffer::new(16);
        let mut writer = buffer.clone();
        writer.write_all(b"shared").unwrap();
        assert_eq!(buffer.contents(), b"shared");
    }
}
