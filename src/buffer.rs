//! Append-only text buffer with regex-triggered monitors.
//!
//! Every monitor remembers where its last match ended and only searches
//! the tail of the buffer after that point, so a monitor never fires twice
//! on the same span of text and the cost of an append stays bounded by the
//! monitor's search window, no matter how large the buffer grows.
//!
//! Offsets and sizes are byte offsets into UTF-8 text. Whenever an offset
//! would fall inside a multi-byte character it is moved to the nearest
//! character boundary.

use std::fmt;

use log::trace;
use regex::{Captures, Regex};

use crate::config::DEFAULT_MONITOR_WINDOW;
use crate::error::FleetError;

/// Callback invoked with the index of the matching pattern and its captures.
pub type MonitorCallback = Box<dyn FnMut(usize, &Captures<'_>)>;

struct Monitor {
    patterns: Vec<Regex>,
    callback: MonitorCallback,
    /// End offset of the last match, relative to the current buffer start.
    last_end: usize,
    /// Maximum number of trailing bytes searched on each append.
    limit: usize,
}

/// A growable text store that notifies monitors about new matches.
///
/// A buffer is owned by a single session and is not shared between
/// threads; callbacks run synchronously inside [`append`](Self::append).
#[derive(Default)]
pub struct MonitoredBuffer {
    data: String,
    monitors: Vec<Monitor>,
}

impl MonitoredBuffer {
    /// Creates an empty buffer without monitors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the buffer size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the whole buffer content.
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Returns up to `n` bytes from the head of the buffer without removing them.
    pub fn head(&self, n: usize) -> &str {
        let end = floor_boundary(&self.data, n);
        &self.data[..end]
    }

    /// Returns up to `n` bytes from the tail of the buffer without removing them.
    pub fn tail(&self, n: usize) -> &str {
        let start = ceil_boundary(&self.data, self.data.len().saturating_sub(n));
        &self.data[start..]
    }

    /// Removes and returns up to `n` bytes from the head of the buffer.
    ///
    /// Monitor offsets are shifted along with the content, so text that was
    /// already matched stays suppressed and fresh text keeps matching.
    pub fn pop(&mut self, n: usize) -> String {
        let end = floor_boundary(&self.data, n);
        let head: String = self.data.drain(..end).collect();
        for monitor in &mut self.monitors {
            monitor.last_end = monitor.last_end.saturating_sub(end);
        }
        head
    }

    /// Appends data and runs every monitor against the new tail.
    pub fn append(&mut self, data: &str) {
        self.data.push_str(data);
        if self.monitors.is_empty() {
            return;
        }

        let buf = self.data.as_str();
        for monitor in &mut self.monitors {
            let window_start = ceil_boundary(buf, buf.len().saturating_sub(monitor.limit));
            let start = monitor.last_end.max(window_start);
            for (index, regex) in monitor.patterns.iter().enumerate() {
                if let Some(caps) = regex.captures_at(buf, start) {
                    let end = caps.get(0).map(|m| m.end()).unwrap_or(start);
                    trace!("Monitor pattern {} matched at {}..{}", index, start, end);
                    monitor.last_end = end;
                    (monitor.callback)(index, &caps);
                    break;
                }
            }
        }
    }

    /// Removes all data and rewinds every monitor.
    pub fn clear(&mut self) {
        self.data.clear();
        for monitor in &mut self.monitors {
            monitor.last_end = 0;
        }
    }

    /// Registers a monitor with the default search window.
    ///
    /// The callback receives the index of the first pattern (in the given
    /// order) that matched, and the match itself.
    pub fn add_monitor<I, S, F>(&mut self, patterns: I, callback: F) -> Result<(), FleetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(usize, &Captures<'_>) + 'static,
    {
        self.add_monitor_with_limit(patterns, callback, DEFAULT_MONITOR_WINDOW)
    }

    /// Registers a monitor that searches at most `limit` trailing bytes.
    pub fn add_monitor_with_limit<I, S, F>(
        &mut self,
        patterns: I,
        callback: F,
        limit: usize,
    ) -> Result<(), FleetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(usize, &Captures<'_>) + 'static,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.add_compiled_monitor(patterns, callback, limit);
        Ok(())
    }

    /// Registers a monitor from already compiled patterns.
    pub fn add_compiled_monitor<F>(&mut self, patterns: Vec<Regex>, callback: F, limit: usize)
    where
        F: FnMut(usize, &Captures<'_>) + 'static,
    {
        self.monitors.push(Monitor {
            patterns,
            callback: Box::new(callback),
            last_end: 0,
            limit,
        });
    }

    /// Number of registered monitors.
    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}

impl fmt::Display for MonitoredBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data)
    }
}

impl fmt::Debug for MonitoredBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredBuffer")
            .field("data", &self.data)
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

fn floor_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
