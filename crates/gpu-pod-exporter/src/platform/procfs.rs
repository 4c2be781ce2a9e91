//! Parent-pid and process-name lookups backed by the `/proc` filesystem.

use core::error::Error;
use std::path::PathBuf;

use derive_more::Display;

/// Errors that can occur while reading process information.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum ProcError {
    #[display("Failed to read proc filesystem: {message}")]
    ProcReadError { message: String },
    #[display("Failed to parse process information: {message}")]
    ParseError { message: String },
}

impl Error for ProcError {}

/// Read access to the host process table.
pub trait ProcessTable: Send + Sync {
    /// Parent pid of `pid`. Fails when the process has exited or is not
    /// readable.
    fn parent_pid(&self, pid: u32) -> Result<u32, ProcError>;

    /// Short command name of `pid`.
    fn process_name(&self, pid: u32) -> Result<String, ProcError>;
}

/// [`ProcessTable`] over a procfs mount, `/proc` by default.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, pid: u32, file: &str) -> Result<String, ProcError> {
        let path = self.root.join(pid.to_string()).join(file);
        std::fs::read_to_string(&path).map_err(|e| ProcError::ProcReadError {
            message: format!("Cannot read {}: {e}", path.display()),
        })
    }

    /// Extracts the ppid from the contents of `/proc/<pid>/stat`.
    ///
    /// The command name is wrapped in parentheses and may itself contain
    /// spaces or parentheses, so fields are counted from the last `)`.
    fn parse_stat_ppid(stat: &str) -> Result<u32, ProcError> {
        let after_comm = stat
            .rfind(')')
            .map(|at| &stat[at + 1..])
            .ok_or_else(|| ProcError::ParseError {
                message: "command name not terminated in stat".to_string(),
            })?;

        // state ppid pgrp ...
        let ppid = after_comm
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| ProcError::ParseError {
                message: "ppid field missing in stat".to_string(),
            })?;

        ppid.parse().map_err(|e| ProcError::ParseError {
            message: format!("Cannot parse ppid {ppid:?}: {e}"),
        })
    }
}

impl ProcessTable for ProcFs {
    fn parent_pid(&self, pid: u32) -> Result<u32, ProcError> {
        let stat = self.read(pid, "stat")?;
        Self::parse_stat_ppid(&stat)
    }

    fn process_name(&self, pid: u32) -> Result<String, ProcError> {
        Ok(self.read(pid, "comm")?.trim_end().to_string())
    }
}
