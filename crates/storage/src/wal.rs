// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only write-ahead log: one newline-delimited JSON record per
//! [`crate::event::StoreEvent`], replayed on open to rebuild
//! [`crate::state::MaterializedState`].

use crate::event::StoreEvent;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub struct Wal {
    file: File,
    path: PathBuf,
    write_seq: u64,
}

impl Wal {
    /// Opens (creating if absent) the WAL at `path` for appending, without
    /// replaying it. Use [`Wal::replay`] first to recover prior state.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let write_seq = Self::count_lines(&path)?;
        Ok(Self { file, path, write_seq })
    }

    fn count_lines(path: &Path) -> io::Result<u64> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let reader = BufReader::new(file);
        Ok(reader.lines().count() as u64)
    }

    /// Replays every event in the WAL file at `path`, in append order. A
    /// trailing truncated line (a crash mid-write) is skipped rather than
    /// failing the whole replay.
    pub fn replay(path: impl AsRef<Path>) -> io::Result<Vec<StoreEvent>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StoreEvent>(&line) {
                Ok(event) => events.push(event),
                Err(_) => continue,
            }
        }
        Ok(events)
    }

    pub fn append(&mut self, event: &StoreEvent) -> io::Result<u64> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.write_seq += 1;
        Ok(self.write_seq)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DirectoryRecord;
    use sessionmux_core::{DirectoryId, TenantId, UserId, WorkspaceId};
    use tempfile::tempdir;

    fn sample_event() -> StoreEvent {
        StoreEvent::DirectoryUpserted {
            record: DirectoryRecord {
                directory_id: DirectoryId::new(),
                tenant_id: TenantId::new(),
                user_id: UserId::new(),
                workspace_id: WorkspaceId::new(),
                cwd: "/tmp".into(),
                archived_at_ms: None,
            },
        }
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.wal");
        let mut wal = Wal::open(&path).expect("open");
        wal.append(&sample_event()).expect("append");
        wal.append(&sample_event()).expect("append");
        wal.flush().expect("flush");

        let replayed = Wal::replay(&path).expect("replay");
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn reopening_resumes_write_seq_from_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.wal");
        {
            let mut wal = Wal::open(&path).expect("open");
            wal.append(&sample_event()).expect("append");
            wal.flush().expect("flush");
        }
        let wal = Wal::open(&path).expect("reopen");
        assert_eq!(wal.write_seq(), 1);
    }

    #[test]
    fn missing_file_replays_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing.wal");
        let replayed = Wal::replay(&path).expect("replay");
        assert!(replayed.is_empty());
    }
}
