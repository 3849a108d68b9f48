//! Streaming extraction of discrete records from the agent output byte
//! stream.
//!
//! The wrapper reads raw agent stdout: concatenated brace-delimited JSON
//! records, arbitrarily fragmented across chunks, possibly separated by log
//! lines and prompt noise. [`StreamParser`] turns that into an ordered
//! sequence of [`AgentMessage`]s without ever blocking.

use crate::protocol::AgentMessage;

/// Incremental parser over a stream of concatenated JSON records.
///
/// Feed chunks as they arrive; each call returns the records completed by
/// that chunk, in input order. Bytes outside records are discarded. A record
/// that fails to decode is dropped silently and does not affect its
/// successors. Each feed scans only the newly arrived bytes.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: String,
    inside_record: bool,
    depth: u32,
    /// Byte offset into `buf` where balance scanning resumes.
    scan: usize,
    in_string: bool,
    escaped: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partially received record is still buffered.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop any buffered partial record and reset scan state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.inside_record = false;
        self.depth = 0;
        self.scan = 0;
        self.in_string = false;
        self.escaped = false;
    }

    /// Consume a chunk and return the records it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<AgentMessage> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        loop {
            if !self.inside_record {
                match self.buf.find('{') {
                    Some(start) => {
                        self.buf.drain(..start);
                        self.inside_record = true;
                        self.depth = 0;
                        self.scan = 0;
                        self.in_string = false;
                        self.escaped = false;
                    }
                    None => {
                        // Nothing but noise; drop it.
                        self.buf.clear();
                        return out;
                    }
                }
            }

            match self.scan_for_close() {
                Some(end) => {
                    let record: String = self.buf.drain(..=end).collect();
                    self.inside_record = false;
                    self.depth = 0;
                    self.scan = 0;
                    self.in_string = false;
                    self.escaped = false;

                    // Decode failures are discarded silently.
                    if let Ok(value) = serde_json::from_str(&record) {
                        if let Some(message) = AgentMessage::classify(value) {
                            out.push(message);
                        }
                    }
                }
                None => {
                    // Record still open; resume here on the next feed.
                    self.scan = self.buf.len();
                    return out;
                }
            }
        }
    }

    /// Scan from the cursor for the byte closing the current record.
    ///
    /// Tracks string literals and escapes so braces inside JSON strings do
    /// not unbalance the count.
    fn scan_for_close(&mut self) -> Option<usize> {
        let bytes = self.buf.as_bytes();
        let mut i = self.scan;
        while i < bytes.len() {
            let b = bytes[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            return Some(i);
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        self.scan = i;
        None
    }
}
