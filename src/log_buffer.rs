//! In-memory capture of recent log output.
//!
//! Poison-message notifications (see [`crate::mail`]) attach the worker's
//! recent logs so a bad book can be diagnosed without shell access to the
//! machine that processed it. Rather than scraping journald, we tee the
//! tracing subscriber's output through a bounded ring buffer.

use std::{
    collections::VecDeque,
    io::{self, Write as _},
    sync::{Arc, Mutex},
};

/// How many log lines to retain for notifications.
const MAX_LINES: usize = 500;

/// A bounded buffer of recent log lines, shared between the tracing
/// subscriber (writer side) and the poison-mail path (reader side).
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The retained log lines, oldest first, joined with newlines.
    pub fn recent(&self) -> String {
        let lines = self.lines.lock().expect("log buffer lock poisoned");
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn push_line(&self, line: &str) {
        let mut lines = self.lines.lock().expect("log buffer lock poisoned");
        if lines.len() == MAX_LINES {
            lines.pop_front();
        }
        lines.push_back(line.to_owned());
    }

    /// Get a writer that tees complete lines into this buffer and everything
    /// into stderr, for use with `tracing_subscriber`.
    pub fn writer(&self) -> TeeWriter {
        TeeWriter {
            buffer: self.clone(),
            partial: String::new(),
        }
    }
}

/// A writer which forwards to stderr while recording complete lines in a
/// [`LogBuffer`].
pub struct TeeWriter {
    buffer: LogBuffer,
    partial: String,
}

impl io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Accumulate until we see full lines; tracing writes one event per
        // `write_all` but there is no guarantee of that.
        self.partial.push_str(&String::from_utf8_lossy(buf));
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            self.buffer.push_line(line.trim_end_matches('\n'));
        }
        io::stderr().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn records_complete_lines() {
        let buffer = LogBuffer::new();
        let mut writer = buffer.writer();
        writer.write_all(b"first line\nsecond ").unwrap();
        writer.write_all(b"half\n").unwrap();
        assert_eq!(buffer.recent(), "first line\nsecond half\n");
    }

    #[test]
    fn drops_oldest_lines_past_capacity() {
        let buffer = LogBuffer::new();
        let mut writer = buffer.writer();
        for i in 0..(MAX_LINES + 10) {
            writeln!(writer, "line {i}").unwrap();
        }
        let recent = buffer.recent();
        assert!(!recent.contains("line 9\n"));
        assert!(recent.contains(&format!("line {}\n", MAX_LINES + 9)));
    }
}
