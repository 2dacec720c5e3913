//! Guest-side line-buffered output.
//!
//! The number of `HC_PRINT` hypercalls observed for a given guest output is
//! part of the ABI: one per completed line, one per full buffer, one for any
//! tail left at teardown. Each guest process owns exactly one buffer.

/// Maximum payload of a single flush. The backing array reserves one extra
/// byte so the flushed bytes are always followed by a NUL terminator, which
/// is what `HC_PRINT` expects to find in guest memory.
pub const PRINT_BUF_SIZE: usize = 1024;

/// Receives one flush per `HC_PRINT` hypercall. The payload slice is
/// guaranteed to be NUL-terminated one byte past its end.
pub trait PrintSink {
    fn write(&mut self, bytes: &[u8]);
}

impl<F: FnMut(&[u8])> PrintSink for F {
    fn write(&mut self, bytes: &[u8]) {
        self(bytes)
    }
}

pub struct LineBuffer<S: PrintSink> {
    buf: [u8; PRINT_BUF_SIZE + 1],
    len: usize,
    sink: S,
}

impl<S: PrintSink> LineBuffer<S> {
    pub fn new(sink: S) -> LineBuffer<S> {
        LineBuffer {
            buf: [0; PRINT_BUF_SIZE + 1],
            len: 0,
            sink,
        }
    }

    pub fn push_byte(&mut self, b: u8) {
        self.buf[self.len] = b;
        self.len += 1;
        if b == b'\n' || self.len == PRINT_BUF_SIZE {
            self.flush();
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_byte(b);
        }
    }

    pub fn flush(&mut self) {
        if self.len == 0 {
            return;
        }
        self.buf[self.len] = 0;
        self.sink.write(&self.buf[..self.len]);
        self.len = 0;
    }
}

impl<S: PrintSink> Drop for LineBuffer<S> {
    fn drop(&mut self) {
        self.flush();
    }
}
