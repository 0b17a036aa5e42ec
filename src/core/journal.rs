//! Append-only run journal with file-based persistence.
//!
//! One directory per run: `events.jsonl` (newline-delimited JSON, easy
//! to inspect), `run.json` (the last persisted run snapshot), and
//! `transcript.log` (the provisioner's captured output). Secret values
//! never appear in any of these files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, Run};

/// File-based journal for a single run
pub struct Journal {
    run_dir: PathBuf,
    events_path: PathBuf,
}

impl Journal {
    /// Create or open the journal for a run under the default runs
    /// directory from the resolved configuration
    pub async fn open(run_id: Uuid) -> Result<Self> {
        let base = crate::config::runs_dir()?;
        Self::open_in(&base, run_id).await
    }

    /// Create or open the journal for a run under an explicit base
    /// directory (tests, embedded use)
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!("failed to open events file: {}", self.events_path.display())
            })?;

        let json = serde_json::to_string(event).context("failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("failed to write event")?;
        file.flush().await.context("failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Persist a snapshot of the run (written when the run is created
    /// and again at its terminal state)
    pub async fn save_run(&self, run: &Run) -> Result<()> {
        let path = self.run_dir.join("run.json");
        let json = serde_json::to_string_pretty(run).context("failed to serialize run")?;

        fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write run snapshot: {}", path.display()))?;

        Ok(())
    }

    /// Load the run snapshot and bring it up to date from the event log
    pub async fn load_run(&self) -> Result<Run> {
        let path = self.run_dir.join("run.json");
        let json = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read run snapshot: {}", path.display()))?;

        let mut run: Run = serde_json::from_str(&json).context("failed to parse run snapshot")?;

        // The snapshot may predate the terminal events (e.g. the runner
        // died mid-run); replaying keeps `status` truthful.
        for event in self.replay().await? {
            run.apply_event(&event);
        }

        Ok(run)
    }

    /// Store the provisioner transcript alongside the events
    pub async fn save_transcript(&self, transcript: &str) -> Result<()> {
        let path = self.run_dir.join("transcript.log");
        fs::write(&path, transcript)
            .await
            .with_context(|| format!("failed to write transcript: {}", path.display()))?;
        Ok(())
    }

    /// Load the provisioner transcript, if one was captured
    pub async fn load_transcript(&self) -> Result<Option<String>> {
        let path = self.run_dir.join("transcript.log");
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read transcript: {}", path.display()))?;
        Ok(Some(content))
    }

    /// List all run IDs under a base directory
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    /// List all run IDs under the configured runs directory
    pub async fn list_runs() -> Result<Vec<Uuid>> {
        let base = crate::config::runs_dir()?;
        Self::list_runs_in(&base).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, LockToken, RunState};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let journal = Journal::open_in(temp.path(), run_id).await.unwrap();

        journal
            .append(&Event::new(run_id, EventType::RunQueued, "queued"))
            .await
            .unwrap();
        journal
            .append(&Event::new(run_id, EventType::LockAcquired, "granted"))
            .await
            .unwrap();

        let events = journal.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunQueued);
        assert_eq!(events[1].event_type, EventType::LockAcquired);
    }

    #[tokio::test]
    async fn test_replay_preserves_order() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let journal = Journal::open_in(temp.path(), run_id).await.unwrap();

        for i in 0..5 {
            journal
                .append(&Event::new(run_id, EventType::RunQueued, format!("event {}", i)))
                .await
                .unwrap();
        }

        let events = journal.replay().await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.summary, format!("event {}", i));
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_with_replay() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let journal = Journal::open_in(temp.path(), run_id).await.unwrap();

        // Snapshot written while the run is still in flight
        let run = Run::new(run_id, "production".to_string(), LockToken::from("production"));
        journal.save_run(&run).await.unwrap();

        // Terminal events land after the snapshot
        journal
            .append(&Event::new(run_id, EventType::LockAcquired, "granted"))
            .await
            .unwrap();
        journal
            .append(&Event::new(run_id, EventType::RunSucceeded, "done"))
            .await
            .unwrap();

        let loaded = journal.load_run().await.unwrap();
        assert_eq!(loaded.id, run_id);
        assert_eq!(loaded.state, RunState::Succeeded);
        assert!(loaded.lock_acquired);
    }

    #[tokio::test]
    async fn test_list_runs() {
        let temp = TempDir::new().unwrap();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        Journal::open_in(temp.path(), first).await.unwrap();
        Journal::open_in(temp.path(), second).await.unwrap();

        // A non-run directory is ignored
        fs::create_dir(temp.path().join("not-a-run")).await.unwrap();

        let mut runs = Journal::list_runs_in(temp.path()).await.unwrap();
        runs.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(runs, expected);
    }

    #[tokio::test]
    async fn test_transcript_roundtrip() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open_in(temp.path(), Uuid::new_v4()).await.unwrap();

        assert!(journal.load_transcript().await.unwrap().is_none());

        journal.save_transcript("PLAY [all] ok=3\n").await.unwrap();
        assert_eq!(
            journal.load_transcript().await.unwrap().as_deref(),
            Some("PLAY [all] ok=3\n")
        );
    }
}
