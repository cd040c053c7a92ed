//! Delivery of user-facing status lines.
//!
//! Every gateway context (caller, listener, sessions) writes through a cloneable
//! [`LogChannel`]. A single consumer thread drains the channel and is the only
//! caller of [`LogSink::append`].

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tokio::sync::mpsc;

/// Receiver of human-readable gateway status lines.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

/// Bounded in-memory line buffer; the oldest lines are evicted first.
pub struct LogBuffer {
    max_lines: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub const DEFAULT_MAX_LINES: usize = 2000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_MAX_LINES)
    }

    pub fn with_capacity(max_lines: usize) -> Self {
        LogBuffer {
            max_lines: max_lines.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<String>> {
        // A panicking appender leaves the buffer itself consistent.
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lines(&self) -> Vec<String> {
        self.guard().iter().cloned().collect()
    }

    pub fn full_text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for LogBuffer {
    fn append(&self, line: &str) {
        let mut lines = self.guard();
        lines.push_back(line.to_string());
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }
}

/// Forwards status lines into the `log` facade.
pub struct LogForwarder;

impl LogSink for LogForwarder {
    fn append(&self, line: &str) {
        log::info!(target: "gateway", "{}", line);
    }
}

/// Sending half of the status-line queue.
#[derive(Clone)]
pub struct LogChannel {
    tx: mpsc::UnboundedSender<String>,
}

impl LogChannel {
    /// Spawns the consumer thread. It exits once every `LogChannel` clone is dropped,
    /// after delivering the lines still queued.
    pub fn spawn(sink: Arc<dyn LogSink>) -> io::Result<(Self, thread::JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let consumer = thread::Builder::new()
            .name("gateway-log".to_string())
            .spawn(move || {
                while let Some(line) = rx.blocking_recv() {
                    sink.append(&line);
                }
            })?;
        Ok((LogChannel { tx }, consumer))
    }

    pub fn line(&self, message: impl Into<String>) {
        // The consumer only goes away after all senders, this one included.
        let _ = self.tx.send(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_evicts_oldest() {
        let buffer = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.append(&format!("line {}", i));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.lines(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.full_text(), "line 2\nline 3\nline 4");

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.full_text(), "");
    }

    #[test]
    fn test_channel_delivers_in_order_from_many_threads() {
        let buffer = Arc::new(LogBuffer::new());
        let (channel, consumer) = LogChannel::spawn(buffer.clone()).unwrap();

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        channel.line(format!("{}:{}", t, i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        drop(channel);
        consumer.join().unwrap();

        let lines = buffer.lines();
        assert_eq!(lines.len(), 200);
        for t in 0..4 {
            let own: Vec<_> = lines
                .iter()
                .filter(|l| l.starts_with(&format!("{}:", t)))
                .cloned()
                .collect();
            let expected: Vec<_> = (0..50).map(|i| format!("{}:{}", t, i)).collect();
            assert_eq!(own, expected);
        }
    }
}
