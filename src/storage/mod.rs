//! Local record storage boundary.
//!
//! The poll cycle treats a record write as a single logical "cell"
//! (`channel` + `subindex`); failures here are logged, never retried.
//! Failed sensor reads are persisted too, as an explicit `Failed` payload;
//! a gap in the timeline would be ambiguous between "not polled" and
//! "polled but failed". The `ERR=<code>` string form only exists at this
//! boundary.

use chrono::Local;
use log::{debug, error};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::utils::error::BusError;

/// What a cell holds: a scaled reading, or the error code of a failed read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordPayload {
    Value(f32),
    Failed(u16),
}

impl fmt::Display for RecordPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordPayload::Value(v) => write!(f, "{:.3}", v),
            RecordPayload::Failed(code) => write!(f, "ERR={}", code),
        }
    }
}

/// Cell key as the record stream spells it: bare channel for sub-index 0
/// ("3"), dotted otherwise ("4.1").
pub fn cell_key(channel: u16, subindex: u8) -> String {
    if subindex == 0 {
        format!("{}", channel)
    } else {
        format!("{}.{}", channel, subindex)
    }
}

pub trait RecordStore: Send + Sync {
    fn save_record(
        &self,
        channel: u16,
        subindex: u8,
        payload: &RecordPayload,
    ) -> Result<(), BusError>;
}

/// Appends dated text records (`date;time;key;value`) to a local file, the
/// format the node's storage card uses.
pub struct FileStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    fn open_if_needed(&self, slot: &mut Option<File>) -> Result<(), BusError> {
        if slot.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| BusError::Storage(format!("create {:?}: {}", parent, e)))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BusError::Storage(format!("open {:?}: {}", self.path, e)))?;
        *slot = Some(file);
        Ok(())
    }
}

impl RecordStore for FileStore {
    fn save_record(
        &self,
        channel: u16,
        subindex: u8,
        payload: &RecordPayload,
    ) -> Result<(), BusError> {
        let mut slot = self
            .file
            .lock()
            .map_err(|_| BusError::Storage("record file lock poisoned".into()))?;
        self.open_if_needed(&mut slot)?;

        let now = Local::now();
        let line = format!(
            "{};{};{};{}\n",
            now.format("%Y-%m-%d"),
            now.format("%H:%M:%S"),
            cell_key(channel, subindex),
            payload
        );
        let Some(file) = slot.as_mut() else {
            return Err(BusError::Storage("record file unavailable".into()));
        };
        match file.write_all(line.as_bytes()) {
            Ok(()) => {
                debug!("record {} -> {}", cell_key(channel, subindex), payload);
                Ok(())
            }
            Err(e) => {
                error!("record write failed ({:?}): {}", self.path, e);
                // drop the handle so the next write reopens
                *slot = None;
                Err(BusError::Storage(format!("write: {}", e)))
            }
        }
    }
}

/// In-memory store for exercising the poll cycle.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<Vec<(u16, u8, String)>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn snapshot(&self) -> Vec<(u16, u8, String)> {
        self.records.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl RecordStore for MemoryStore {
    fn save_record(
        &self,
        channel: u16,
        subindex: u8,
        payload: &RecordPayload,
    ) -> Result<(), BusError> {
        self.records
            .lock()
            .unwrap()
            .push((channel, subindex, payload.to_string()));
        Ok(())
    }
}
