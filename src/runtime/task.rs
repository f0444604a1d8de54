// src/runtime/task.rs
//! Event-sourced task state, inbound signals and the per-task serialization point.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use super::journal::Journal;
use super::TaskId;
use crate::error::{PipelineError, Result};

/// State that is rebuilt by folding its journaled events in order.
pub trait DurableState: Send + 'static {
    type Event: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;

    /// Must be deterministic: replaying the same events yields the same state.
    fn apply(&mut self, event: &Self::Event);

    /// Events that rebuild the current state from scratch. Used by compaction.
    fn snapshot(&self) -> Vec<Self::Event>;
}

/// Journal plus the live inbox of whichever context is currently attached.
/// Both signal delivery and the task's own records go through this one lock.
pub(crate) struct TaskCell<E> {
    pub(crate) inner: Mutex<CellInner<E>>,
}

pub(crate) struct CellInner<E> {
    pub(crate) journal: Journal<E>,
    pub(crate) inbox: Option<mpsc::UnboundedSender<E>>,
}

impl<E> TaskCell<E> {
    pub(crate) fn new(journal: Journal<E>) -> Self {
        Self {
            inner: Mutex::new(CellInner {
                journal,
                inbox: None,
            }),
        }
    }
}

/// Durable, fire-and-forget signal channel into one task.
pub struct SignalSender<E> {
    target: TaskId,
    cell: Arc<TaskCell<E>>,
}

impl<E> Clone for SignalSender<E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<E> fmt::Debug for SignalSender<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSender")
            .field("target", &self.target)
            .finish()
    }
}

impl<E: Serialize + DeserializeOwned + Send + 'static> SignalSender<E> {
    pub(crate) fn new(target: TaskId, cell: Arc<TaskCell<E>>) -> Self {
        Self { target, cell }
    }

    pub fn target(&self) -> &TaskId {
        &self.target
    }

    /// Returns once the signal is journaled on the target's history. No acknowledgement
    /// from the target is awaited; if it is not attached, replay picks the signal up.
    pub async fn deliver(&self, event: E) -> Result<()> {
        let mut inner = self.cell.inner.lock().await;
        let seq = inner.journal.append(&event).await?;
        if let Some(tx) = &inner.inbox {
            // A closed receiver means the target is restarting; replay covers it.
            let _ = tx.send(event);
        }
        drop(inner);
        counter!("pipeline_signals_delivered_total", "task" => self.target.to_string())
            .increment(1);
        tracing::debug!(target: "runtime", task = %self.target, seq, "signal journaled");
        Ok(())
    }
}

/// A running task's view of its own durable state.
pub struct TaskContext<S: DurableState> {
    id: TaskId,
    cell: Arc<TaskCell<S::Event>>,
    inbox: mpsc::UnboundedReceiver<S::Event>,
    state: S,
    replayed: usize,
}

impl<S: DurableState> fmt::Debug for TaskContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("replayed", &self.replayed)
            .finish()
    }
}

impl<S: DurableState> TaskContext<S> {
    /// Replay the journal into `initial` and install a fresh inbox, under the cell lock
    /// so each signal lands either in the replay or in the new inbox, never both.
    pub(crate) async fn attach(id: TaskId, cell: Arc<TaskCell<S::Event>>, initial: S) -> Result<Self> {
        let mut inner = cell.inner.lock().await;
        let path = inner.journal.path().to_path_buf();
        let (journal, events) = Journal::<S::Event>::open(path).await?;
        inner.journal = journal;

        let mut state = initial;
        for ev in &events {
            state.apply(ev);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.inbox = Some(tx);
        drop(inner);

        if !events.is_empty() {
            tracing::info!(target: "runtime", task = %id, events = events.len(), "task state replayed");
        }
        Ok(Self {
            id,
            cell,
            inbox: rx,
            state,
            replayed: events.len(),
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Number of journal events folded in when this context attached.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    fn drain_inbox(&mut self) -> usize {
        let mut n = 0;
        while let Ok(ev) = self.inbox.try_recv() {
            self.state.apply(&ev);
            n += 1;
        }
        n
    }

    /// Apply every signal journaled so far.
    pub async fn absorb_signals(&mut self) -> Result<usize> {
        let cell = Arc::clone(&self.cell);
        let _guard = cell.inner.lock().await;
        Ok(self.drain_inbox())
    }

    /// Journal `event`, then apply it. Pending signals are applied first so in-memory
    /// order matches journal order.
    pub async fn record(&mut self, event: S::Event) -> Result<()> {
        let cell = Arc::clone(&self.cell);
        let mut inner = cell.inner.lock().await;
        self.drain_inbox();
        inner.journal.append(&event).await?;
        drop(inner);
        self.state.apply(&event);
        Ok(())
    }

    /// Suspend until `pred` holds, applying signals as they arrive.
    pub async fn wait_until<F>(&mut self, pred: F) -> Result<()>
    where
        F: Fn(&S) -> bool,
    {
        loop {
            if pred(&self.state) {
                return Ok(());
            }
            match self.inbox.recv().await {
                Some(ev) => self.state.apply(&ev),
                None => {
                    return Err(PipelineError::scheduler(anyhow::anyhow!(
                        "inbox of task {} was detached",
                        self.id
                    )))
                }
            }
        }
    }

    /// Suspend until the wall-clock deadline. Returns immediately if it already passed.
    pub async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }

    /// Rewrite the journal as the state's snapshot.
    pub async fn compact(&mut self) -> Result<()> {
        let cell = Arc::clone(&self.cell);
        let mut inner = cell.inner.lock().await;
        self.drain_inbox();
        let before = inner.journal.len();
        let events = self.state.snapshot();
        inner.journal.rewrite(&events).await?;
        drop(inner);
        tracing::debug!(target: "runtime", task = %self.id, before, after = events.len(), "journal compacted");
        Ok(())
    }

    pub async fn journal_len(&self) -> usize {
        self.cell.inner.lock().await.journal.len()
    }
}
