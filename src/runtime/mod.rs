// src/runtime/mod.rs
//! Durable task runtime: identity, journaled progress, durable signals, restart.
//!
//! Each task owns a journal at `<state_dir>/<task-id>.journal`. Task state is only
//! ever rebuilt by replaying that journal, and signals to a task are journaled on it
//! before the sender returns.

pub mod journal;
pub mod supervisor;
pub mod task;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{PipelineError, Result};
use journal::Journal;
use task::TaskCell;

pub use supervisor::spawn_supervised;
pub use task::{DurableState, SignalSender, TaskContext};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    /// Ids double as file names, so only `[A-Za-z0-9_-]` is accepted.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let ok = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if ok {
            Ok(Self(id))
        } else {
            Err(PipelineError::Config(format!("invalid task id {id:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type AnyCell = Arc<dyn Any + Send + Sync>;

/// Process-wide registry of task cells. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    dir: PathBuf,
    cells: Mutex<HashMap<TaskId, AnyCell>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("dir", &self.inner.dir)
            .finish()
    }
}

impl Runtime {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating state dir {}", dir.display()))
            .map_err(PipelineError::scheduler)?;
        tracing::info!(target: "runtime", dir = %dir.display(), "runtime opened");
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                dir,
                cells: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn journal_path(&self, id: &TaskId) -> PathBuf {
        self.inner.dir.join(format!("{id}.journal"))
    }

    async fn cell<E>(&self, id: &TaskId) -> Result<Arc<TaskCell<E>>>
    where
        E: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut cells = self.inner.cells.lock().await;
        let any = match cells.get(id) {
            Some(c) => Arc::clone(c),
            None => {
                let (journal, _) = Journal::<E>::open(self.journal_path(id)).await?;
                let cell: AnyCell = Arc::new(TaskCell::new(journal));
                cells.insert(id.clone(), Arc::clone(&cell));
                cell
            }
        };
        any.downcast::<TaskCell<E>>().map_err(|_| {
            PipelineError::Config(format!("task {id} is registered with another event type"))
        })
    }

    /// Attach to a task starting from its default state.
    pub async fn attach<S>(&self, id: &TaskId) -> Result<TaskContext<S>>
    where
        S: DurableState + Default,
    {
        self.attach_with(id, S::default()).await
    }

    /// Attach to a task, replaying its journal on top of `initial`. Attaching again
    /// (after a crash) detaches the previous context's inbox.
    pub async fn attach_with<S: DurableState>(&self, id: &TaskId, initial: S) -> Result<TaskContext<S>> {
        let cell = self.cell::<S::Event>(id).await?;
        TaskContext::attach(id.clone(), cell, initial).await
    }

    /// Durable signal channel into `id`. The target need not be running yet.
    pub async fn signal_sender<E>(&self, id: &TaskId) -> Result<SignalSender<E>>
    where
        E: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let cell = self.cell::<E>(id).await?;
        Ok(SignalSender::new(id.clone(), cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default)]
    struct Counter {
        total: i64,
        seen: usize,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Add(i64),
        Reset(i64),
    }

    impl DurableState for Counter {
        type Event = CounterEvent;

        fn apply(&mut self, event: &CounterEvent) {
            match event {
                CounterEvent::Add(n) => {
                    self.total += n;
                    self.seen += 1;
                }
                CounterEvent::Reset(n) => self.total = *n,
            }
        }

        fn snapshot(&self) -> Vec<CounterEvent> {
            vec![CounterEvent::Reset(self.total)]
        }
    }

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[test]
    fn task_ids_must_be_file_safe() {
        assert!(TaskId::new("producer-reddit").is_ok());
        assert!(TaskId::new("").is_err());
        assert!(TaskId::new("../etc").is_err());
        assert!(TaskId::new("a b").is_err());
    }

    #[tokio::test]
    async fn signals_sent_before_attach_are_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::open(dir.path()).await.unwrap();
        let tx = rt.signal_sender::<CounterEvent>(&id("c")).await.unwrap();
        tx.deliver(CounterEvent::Add(2)).await.unwrap();
        tx.deliver(CounterEvent::Add(3)).await.unwrap();

        let ctx = rt.attach::<Counter>(&id("c")).await.unwrap();
        assert_eq!(ctx.state().total, 5);
        assert_eq!(ctx.replayed(), 2);
    }

    #[tokio::test]
    async fn live_signals_wake_a_waiting_task() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::open(dir.path()).await.unwrap();
        let mut ctx = rt.attach::<Counter>(&id("c")).await.unwrap();
        let tx = rt.signal_sender::<CounterEvent>(&id("c")).await.unwrap();

        let sender = tokio::spawn(async move {
            tx.deliver(CounterEvent::Add(4)).await.unwrap();
        });
        ctx.wait_until(|s| s.total >= 4).await.unwrap();
        sender.await.unwrap();
        assert_eq!(ctx.state().total, 4);
    }

    #[tokio::test]
    async fn state_survives_a_new_runtime_on_the_same_dir() {
        let dir = tempfile::tempdir().unwrap();
        {
            let rt = Runtime::open(dir.path()).await.unwrap();
            let mut ctx = rt.attach::<Counter>(&id("c")).await.unwrap();
            ctx.record(CounterEvent::Add(10)).await.unwrap();
            let tx = rt.signal_sender::<CounterEvent>(&id("c")).await.unwrap();
            tx.deliver(CounterEvent::Add(1)).await.unwrap();
            // signal still sitting in the inbox: the journal already has it
        }
        let rt = Runtime::open(dir.path()).await.unwrap();
        let ctx = rt.attach::<Counter>(&id("c")).await.unwrap();
        assert_eq!(ctx.state().total, 11);
    }

    #[tokio::test]
    async fn compaction_keeps_state_and_pending_signals() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::open(dir.path()).await.unwrap();
        let mut ctx = rt.attach::<Counter>(&id("c")).await.unwrap();
        for _ in 0..20 {
            ctx.record(CounterEvent::Add(1)).await.unwrap();
        }
        let tx = rt.signal_sender::<CounterEvent>(&id("c")).await.unwrap();
        tx.deliver(CounterEvent::Add(5)).await.unwrap();

        ctx.compact().await.unwrap();
        assert_eq!(ctx.journal_len().await, 1);
        assert_eq!(ctx.state().total, 25);

        let again = rt.attach::<Counter>(&id("c")).await.unwrap();
        assert_eq!(again.state().total, 25);
    }

    #[tokio::test]
    async fn mismatched_event_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::open(dir.path()).await.unwrap();
        let _ctx = rt.attach::<Counter>(&id("c")).await.unwrap();
        let err = rt.signal_sender::<String>(&id("c")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
