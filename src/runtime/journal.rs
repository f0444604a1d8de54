// src/runtime/journal.rs
//! Append-only, checksummed JSON-lines journal: one per task.
//!
//! Line format: `<16 hex chars of sha256(json)>\t<json>\n` where `json` is a
//! [`JournalRecord`]. A torn last line (crash mid-append) is truncated away on open;
//! a bad line anywhere else is corruption and fails the open.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord<E> {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: E,
}

#[derive(Serialize)]
struct RecordRef<'a, E> {
    seq: u64,
    at: DateTime<Utc>,
    event: &'a E,
}

pub struct Journal<E> {
    path: PathBuf,
    /// `None` once the handle can no longer be trusted to match the file on disk.
    /// Appends fail until the journal is reopened.
    file: Option<File>,
    /// Byte length of the valid content.
    len: u64,
    next_seq: u64,
    records: usize,
    #[cfg(test)]
    faults: Faults,
    _event: PhantomData<fn() -> E>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
    /// Write only this many bytes of the next append, then fail.
    short_write: Option<usize>,
    /// Fail reopening the file after a rewrite's rename.
    reopen: bool,
}

impl<E> std::fmt::Debug for Journal<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("next_seq", &self.next_seq)
            .field("records", &self.records)
            .field("poisoned", &self.file.is_none())
            .finish()
    }
}

fn checksum(json: &str) -> String {
    let digest = Sha256::digest(json.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn encode<E: Serialize>(seq: u64, event: &E) -> Result<String> {
    let rec = RecordRef {
        seq,
        at: Utc::now(),
        event,
    };
    let json = serde_json::to_string(&rec)
        .context("serialize journal record")
        .map_err(PipelineError::scheduler)?;
    Ok(format!("{}\t{}\n", checksum(&json), json))
}

fn decode<E: DeserializeOwned>(line: &str) -> anyhow::Result<JournalRecord<E>> {
    let line = line.trim_end_matches('\n');
    let (sum, json) = line
        .split_once('\t')
        .ok_or_else(|| anyhow!("missing checksum separator"))?;
    if checksum(json) != sum {
        return Err(anyhow!("checksum mismatch"));
    }
    Ok(serde_json::from_str(json)?)
}

/// Parse journal text. Returns the records and the byte length of the valid prefix.
fn parse<E: DeserializeOwned>(path: &Path, text: &str) -> Result<(Vec<JournalRecord<E>>, usize)> {
    let chunks: Vec<&str> = text.split_inclusive('\n').collect();
    let mut out = Vec::with_capacity(chunks.len());
    let mut good = 0usize;

    for (i, chunk) in chunks.iter().enumerate() {
        let is_last = i + 1 == chunks.len();
        let complete = chunk.ends_with('\n');
        match decode::<E>(chunk) {
            Ok(rec) if complete => {
                out.push(rec);
                good += chunk.len();
            }
            res if is_last => {
                let why = res.err().map(|e| e.to_string()).unwrap_or_else(|| "unterminated line".into());
                tracing::warn!(
                    target: "journal",
                    path = %path.display(),
                    offset = good,
                    reason = %why,
                    "dropping torn journal tail"
                );
            }
            res => {
                let why = res.err().map(|e| e.to_string()).unwrap_or_else(|| "unterminated line".into());
                return Err(PipelineError::scheduler(anyhow!(
                    "corrupt journal {} at line {}: {why}",
                    path.display(),
                    i + 1
                )));
            }
        }
    }
    Ok((out, good))
}

/// Read every record without opening the journal for writing.
pub async fn read_records<E: DeserializeOwned>(path: &Path) -> Result<Vec<JournalRecord<E>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(parse(path, &String::from_utf8_lossy(&bytes))?.0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(PipelineError::scheduler(
            anyhow::Error::new(e).context(format!("reading journal {}", path.display())),
        )),
    }
}

impl<E: Serialize + DeserializeOwned> Journal<E> {
    /// Open (creating if needed) and replay. A torn tail is truncated before appends resume.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<E>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating journal dir {}", parent.display()))
                .map_err(PipelineError::scheduler)?;
        }

        // Invalid UTF-8 can only come from a torn tail; lossy decoding leaves valid lines intact.
        let text = match fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(PipelineError::scheduler(
                    anyhow::Error::new(e).context(format!("reading journal {}", path.display())),
                ))
            }
        };
        let (records, good) = parse::<E>(&path, &text)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening journal {}", path.display()))
            .map_err(PipelineError::scheduler)?;
        if good < text.len() {
            file.set_len(good as u64)
                .await
                .context("truncating torn journal tail")
                .map_err(PipelineError::scheduler)?;
        }

        let next_seq = records.last().map(|r| r.seq + 1).unwrap_or(0);
        let journal = Self {
            path,
            file: Some(file),
            len: good as u64,
            next_seq,
            records: records.len(),
            #[cfg(test)]
            faults: Faults::default(),
            _event: PhantomData,
        };
        Ok((journal, records.into_iter().map(|r| r.event).collect()))
    }

    /// Durably append one event; returns its sequence number.
    ///
    /// A failed write is cut back off the file so later appends stay readable. If that
    /// cut fails too, the journal is poisoned.
    pub async fn append(&mut self, event: &E) -> Result<u64> {
        let seq = self.next_seq;
        let line = encode(seq, event)?;
        let Some(file) = self.file.as_mut() else {
            return Err(self.poisoned());
        };

        #[cfg(test)]
        let written = Self::write_line(file, line.as_bytes(), self.faults.short_write.take()).await;
        #[cfg(not(test))]
        let written = Self::write_line(file, line.as_bytes()).await;
        if let Err(e) = written {
            if let Err(trunc) = file.set_len(self.len).await {
                tracing::error!(
                    target: "journal",
                    path = %self.path.display(),
                    error = %trunc,
                    "could not cut a failed append, poisoning journal"
                );
                self.file = None;
            }
            return Err(PipelineError::scheduler(
                anyhow::Error::new(e).context(format!("appending to journal {}", self.path.display())),
            ));
        }
        self.len += line.len() as u64;
        self.next_seq += 1;
        self.records += 1;
        Ok(seq)
    }

    async fn write_line(
        file: &mut File,
        bytes: &[u8],
        #[cfg(test)] short_write: Option<usize>,
    ) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(n) = short_write {
            file.write_all(&bytes[..n.min(bytes.len())]).await?;
            file.flush().await?;
            return Err(std::io::Error::other("injected short write"));
        }
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_data().await
    }

    fn poisoned(&self) -> PipelineError {
        PipelineError::scheduler(anyhow!(
            "journal {} is poisoned by an earlier write failure; reopen it",
            self.path.display()
        ))
    }

    /// Atomically replace the journal with `events` (temp file + rename).
    /// Sequence numbers keep increasing across rewrites.
    pub async fn rewrite(&mut self, events: &[E]) -> Result<()> {
        let tmp = self.path.with_extension("journal.tmp");
        let mut buf = String::new();
        let mut seq = self.next_seq;
        for ev in events {
            buf.push_str(&encode(seq, ev)?);
            seq += 1;
        }

        let written: anyhow::Result<()> = async {
            let mut f = File::create(&tmp).await?;
            f.write_all(buf.as_bytes()).await?;
            f.flush().await?;
            f.sync_all().await?;
            drop(f);
            fs::rename(&tmp, &self.path).await?;
            Ok(())
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(PipelineError::scheduler(
                e.context(format!("compacting journal {}", self.path.display())),
            ));
        }

        // The old handle now points at the replaced file.
        self.file = None;
        let file = self
            .reopen()
            .await
            .with_context(|| format!("reopening compacted journal {}", self.path.display()))
            .map_err(PipelineError::scheduler)?;
        self.file = Some(file);
        self.len = buf.len() as u64;
        self.next_seq = seq;
        self.records = events.len();
        Ok(())
    }

    async fn reopen(&mut self) -> std::io::Result<File> {
        #[cfg(test)]
        if std::mem::take(&mut self.faults.reopen) {
            return Err(std::io::Error::other("injected reopen failure"));
        }
        OpenOptions::new().append(true).open(&self.path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records currently in the file.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}
