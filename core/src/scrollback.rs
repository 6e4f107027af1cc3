//! Per-session scrollback: an ordered list of output chunks capped by total
//! byte size. Late-attaching viewers get the concatenated tail as a snapshot.

use std::collections::VecDeque;

use bytes::Bytes;

/// Total bytes retained per session. Oldest chunks are dropped first.
pub const SCROLLBACK_CAP_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug)]
pub struct Scrollback {
    chunks: VecDeque<Bytes>,
    total: usize,
    cap: usize,
}

impl Scrollback {
    pub fn new() -> Self {
        Self::with_capacity(SCROLLBACK_CAP_BYTES)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { chunks: VecDeque::new(), total: 0, cap }
    }

    /// Append one output chunk, evicting from the head until under the cap.
    /// The cap is enforced by byte count, never chunk count.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push_back(chunk);
        while self.total > self.cap {
            match self.chunks.pop_front() {
                Some(old) => self.total -= old.len(),
                None => break,
            }
        }
    }

    /// Current retained size in bytes.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Concatenate the retained chunks into one string. PTY output is treated
    /// as UTF-8; bytes that do not decode are replaced rather than dropped so
    /// the snapshot length stays bounded by the cap.
    pub fn snapshot(&self) -> String {
        let mut joined = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            joined.extend_from_slice(chunk);
        }
        String::from_utf8_lossy(&joined).into_owned()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn byte_cap_holds_under_write_load() {
        let mut sb = Scrollback::with_capacity(1024);
        for i in 0..1000 {
            sb.push(Bytes::from(vec![b'a' + (i % 26) as u8; 100]));
            assert!(sb.len() <= 1024);
        }
    }

    #[test]
    fn keeps_the_most_recent_output() {
        let mut sb = Scrollback::with_capacity(10);
        sb.push(Bytes::from_static(b"oldoldold"));
        sb.push(Bytes::from_static(b"fresh"));
        // The 9-byte chunk was evicted to stay under 10 bytes total.
        assert_eq!(sb.snapshot(), "fresh");
    }

    #[test]
    fn eviction_is_chunk_at_a_time_from_the_head() {
        let mut sb = Scrollback::with_capacity(10);
        sb.push(Bytes::from_static(b"aaaa"));
        sb.push(Bytes::from_static(b"bbbb"));
        sb.push(Bytes::from_static(b"cc"));
        assert_eq!(sb.snapshot(), "aaaabbbbcc");
        sb.push(Bytes::from_static(b"d"));
        assert_eq!(sb.snapshot(), "bbbbccd");
    }

    #[test]
    fn snapshot_of_six_mib_is_bounded_and_is_the_tail() {
        let mut sb = Scrollback::new();
        let mut written = 0usize;
        let mut marker = 0u64;
        while written < 6 * 1024 * 1024 {
            let line = format!("{marker:016}\n");
            written += line.len();
            marker += 1;
            sb.push(Bytes::from(line));
        }
        assert!(sb.len() <= SCROLLBACK_CAP_BYTES);
        let snap = sb.snapshot();
        assert!(snap.len() <= SCROLLBACK_CAP_BYTES);
        let last = format!("{:016}\n", marker - 1);
        assert!(snap.ends_with(&last));
    }
}
