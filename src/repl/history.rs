//! Persistent command history.
//!
//! One file, one line per accepted command. The file is read once at
//! open and capped there; pushes go straight to disk so a crash loses
//! at most nothing. History is convenience, not data: every failure
//! mode degrades to an empty or shorter history, never to an error the
//! session has to care about.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

const HISTORY_FILE: &str = ".tinykv_history";

/// Entries kept when the file is trimmed at open.
const MAX_ENTRIES: usize = 1000;

pub struct History {
    path: PathBuf,
    entries: Vec<String>,
}

impl History {
    /// Loads the history behind `path`. Oversized files are trimmed to
    /// the most recent [`MAX_ENTRIES`] lines; an unreadable file is an
    /// empty history.
    pub fn open(path: PathBuf) -> Self {
        let mut entries: Vec<String> = fs::read_to_string(&path)
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if entries.len() > MAX_ENTRIES {
            entries.drain(..entries.len() - MAX_ENTRIES);
            let _ = fs::write(&path, entries.join("\n") + "\n");
        }
        History { path, entries }
    }

    /// History file in the home directory, falling back to the working
    /// directory when no home is known.
    pub fn default_location() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(HISTORY_FILE)
    }

    /// Records one accepted line. Blank lines and a repeat of the most
    /// recent entry are dropped rather than stored.
    pub fn push(&mut self, line: &str) -> io::Result<()> {
        let line = line.trim();
        if line.is_empty() || self.entries.last().map(String::as_str) == Some(line) {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        self.entries.push(line.to_string());
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
