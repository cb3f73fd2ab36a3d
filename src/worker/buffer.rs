use tokio::sync::Notify;

/// Fixed-capacity line accumulator bounded by count and byte size.
///
/// Many producers add lines; a single flusher drains them. A refused add
/// returns the line to the caller, who kicks the flusher and retries once
/// rather than blocking.
pub struct BatchBuffer {
    max_lines: usize,
    max_bytes: usize,
    inner: parking_lot::Mutex<Inner>,
    kick: Notify,
}

struct Inner {
    lines: Vec<String>,
    bytes: usize,
}

impl BatchBuffer {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            max_lines,
            max_bytes,
            inner: parking_lot::Mutex::new(Inner {
                lines: Vec::with_capacity(max_lines.min(4096)),
                bytes: 0,
            }),
            kick: Notify::new(),
        }
    }

    /// Appends a line, accounting one byte for its newline terminator.
    /// Returns the line back when either bound would be exceeded.
    pub fn add(&self, line: String) -> Result<(), String> {
        let mut inner = self.inner.lock();
        if inner.lines.len() >= self.max_lines || inner.bytes + line.len() + 1 > self.max_bytes {
            return Err(line);
        }

        inner.bytes += line.len() + 1;
        inner.lines.push(line);
        Ok(())
    }

    /// Atomically takes and clears the accumulated lines.
    pub fn flush(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.bytes = 0;
        std::mem::take(&mut inner.lines)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Wakes the flusher for an eager flush.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Resolves when a producer kicks the buffer.
    pub async fn kicked(&self) {
        self.kick.notified().await;
    }
}
