use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Buffered events are written out once this many are pending
const FLUSH_THRESHOLD: usize = 100;

/// Event log using gzip-compressed JSON Lines, one file per run per day
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffer: RwLock<Vec<Event>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(Vec::new()),
        })
    }

    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: NaiveDate) -> PathBuf {
        self.day_dir(date).join(format!("{}.jsonl.gz", run_id))
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    /// Write every buffered event to its run's file for that day
    async fn flush_buffer(&self) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        if buffer.is_empty() {
            return Ok(());
        }

        let mut grouped: HashMap<(RunId, NaiveDate), Vec<Event>> = HashMap::new();
        for event in buffer.drain(..) {
            grouped
                .entry((event.run_id, event.timestamp.date_naive()))
                .or_default()
                .push(event);
        }

        for ((run_id, date), events) in grouped {
            let path = self.event_log_path(&run_id, date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// All event files for a run across days
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();

        // Walk year/month/day directories
        for year in subdirs(&events_dir)? {
            for month in subdirs(&year)? {
                for day in subdirs(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn subdirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let pending = {
            let mut buffer = self.buffer.write().await;
            buffer.push(event);
            buffer.len()
        };

        if pending > FLUSH_THRESHOLD {
            self.flush_buffer().await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        self.flush_buffer().await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);

        Ok(all_events)
    }

    async fn flush(&self) -> Result<()> {
        self.flush_buffer().await
    }
}
