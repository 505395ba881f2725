//! Per-poll log buffer.
//!
//! Each poll job logs through one of these: lines go to the process log via
//! `tracing` and are also buffered, so the full transcript of the poll can
//! be stored next to the status record for the UI.

use std::fmt;

pub struct PollLog {
    server_id: String,
    buf: Vec<String>,
}

impl PollLog {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_owned(),
            buf: Vec::new(),
        }
    }

    pub fn debug(&mut self, msg: impl fmt::Display) {
        tracing::debug!(target: "poll", "{}: {msg}", self.server_id);
        self.append("DEBUG", msg);
    }

    pub fn info(&mut self, msg: impl fmt::Display) {
        tracing::info!(target: "poll", "{}: {msg}", self.server_id);
        self.append("INFO", msg);
    }

    pub fn warn(&mut self, msg: impl fmt::Display) {
        tracing::warn!(target: "poll", "{}: {msg}", self.server_id);
        self.append("WARNING", msg);
    }

    pub fn error(&mut self, msg: impl fmt::Display) {
        tracing::error!(target: "poll", "{}: {msg}", self.server_id);
        self.append("ERROR", msg);
    }

    fn append(&mut self, level: &str, msg: impl fmt::Display) {
        let t = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        self.buf.push(format!("{t} - poll - {level} - {msg}"));
    }

    /// The buffered transcript, one line per record.
    pub fn into_string(self) -> String {
        let mut s = self.buf.join("\n");
        s.push('\n');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_formatted_lines() {
        let mut log = PollLog::new("T2TEST");
        log.info("polling");
        log.error(format_args!("probe failed: {}", "timeout"));

        let s = log.into_string();
        let lines: Vec<&str> = s.trim_end().lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" - poll - INFO - polling"));
        assert!(lines[1].contains(" - poll - ERROR - probe failed: timeout"));
    }
}
