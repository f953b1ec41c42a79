//! Offline mutation queue.
//!
//! Mutations attempted while offline are queued under a tag and replayed,
//! in enqueue order, when a reconnect signal for that tag fires. Delivery is
//! at-least-once: a failed replay stays pending for the next signal.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::TaskStorage;

/// The request a queued task re-issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
  pub method: String,
  pub path: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<serde_json::Value>,
}

impl Mutation {
  pub fn new(method: &Method, path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
    Self {
      method: method.as_str().to_string(),
      path: path.into(),
      body,
    }
  }

  #[allow(dead_code)]
  pub fn post(path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
    Self::new(&Method::POST, path, body)
  }

  pub fn method(&self) -> Result<Method> {
    Method::from_str(&self.method).map_err(|e| eyre!("Invalid method '{}': {}", self.method, e))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Pending,
  Replaying,
}

impl TaskState {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskState::Pending => "pending",
      TaskState::Replaying => "replaying",
    }
  }
}

/// A queued offline mutation. Completed tasks are deleted, not kept.
#[derive(Debug, Clone)]
pub struct ReplayTask {
  pub id: i64,
  pub tag: String,
  pub mutation: Mutation,
  pub state: TaskState,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub enqueued_at: DateTime<Utc>,
}

/// Outcome of one reconnect signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  pub replayed: usize,
  pub failed: usize,
}

pub struct ReplayQueue<S> {
  storage: Arc<S>,
}

impl<S: TaskStorage> ReplayQueue<S> {
  /// Open the queue, returning tasks orphaned mid-replay to pending.
  pub fn new(storage: Arc<S>) -> Result<Self> {
    let reset = storage.reset_interrupted()?;
    if reset > 0 {
      info!(tasks = reset, "Requeued tasks interrupted during replay");
    }
    Ok(Self { storage })
  }

  /// Queue a mutation for the next reconnect signal.
  pub fn enqueue(&self, tag: &str, mutation: Mutation) -> Result<i64> {
    let id = self.storage.insert_task(tag, &mutation)?;
    info!(%tag, id, method = %mutation.method, path = %mutation.path, "Queued offline mutation");
    Ok(id)
  }

  pub fn pending(&self, tag: &str) -> Result<Vec<ReplayTask>> {
    self.storage.pending_tasks(tag)
  }

  /// Replay every pending task for `tag`, oldest first.
  ///
  /// Replay failures are recorded on the task and reported in the summary;
  /// only storage errors are returned as `Err`.
  pub async fn on_reconnect_signal<F, Fut>(&self, tag: &str, replay: F) -> Result<ReplayReport>
  where
    F: Fn(ReplayTask) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    let tasks = self.storage.pending_tasks(tag)?;
    let mut report = ReplayReport::default();

    for task in tasks {
      let id = task.id;
      self.storage.set_task_state(id, TaskState::Replaying)?;

      match replay(ReplayTask {
        state: TaskState::Replaying,
        ..task
      })
      .await
      {
        Ok(()) => {
          self.storage.remove_task(id)?;
          report.replayed += 1;
        }
        Err(e) => {
          warn!(%tag, id, error = %e, "Replay failed, task stays pending");
          self.storage.record_failure(id)?;
          report.failed += 1;
        }
      }
    }

    info!(%tag, replayed = report.replayed, failed = report.failed, "Reconnect signal processed");
    Ok(report)
  }
}
