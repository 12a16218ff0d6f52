//! Upload task registry
//!
//! Owns every upload task and applies the lifecycle transitions:
//!
//! ```text
//! waiting -> uploading -> merging -> success -> (removed)
//!    \           \           \
//!     +-----------+-----------+----> error --retry--> waiting
//! ```
//!
//! Pipelines hold a [`TaskHandle`] for one attempt. Writes carrying a stale
//! attempt number are ignored, so a superseded pipeline cannot touch the
//! task after a retry.

use crate::error::{Error, Result};
use crate::progress::percent;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry-assigned task identifier
pub type TaskId = u64;

/// Message recorded when the user cancels a task
pub const CANCELLED_MESSAGE: &str = "cancelled by user";

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Uploading,
    Merging,
    Success,
    Error,
}

impl TaskStatus {
    /// Still owned by a running pipeline
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Waiting | TaskStatus::Uploading | TaskStatus::Merging
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Merging => "merging",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub file_name: String,
    pub file_size: u64,
    /// Whole percent in `[0, 100]`
    pub progress: u8,
    /// Bytes per second
    pub speed: f64,
    pub status: TaskStatus,
    pub message: String,
    pub processed_bytes: u64,
    pub last_update: DateTime<Utc>,
    /// Server location once the upload succeeded
    pub location: Option<String>,
    /// Incremented by every retry
    pub attempt: u32,
}

/// A pipeline's claim on one attempt of a task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: TaskId,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Active task moved to `error`
    Cancelled,
    /// Finished task removed
    Removed,
    /// Task already failed
    Unchanged,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Waiting, uploading or merging
    pub uploading: usize,
}

/// Change notification for observers
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Updated(UploadTask),
    Removed(TaskId),
}

struct Entry {
    task: UploadTask,
    cancel: CancellationToken,
}

struct Inner {
    next_id: TaskId,
    entries: BTreeMap<TaskId, Entry>,
}

/// Shared collection of upload tasks
pub struct UploadRegistry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<TaskEvent>,
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        UploadRegistry {
            inner: RwLock::new(Inner {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
            events,
        }
    }

    /// Receive a snapshot after every transition
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Publish `event`. Callers hold the write lock so subscribers observe
    /// transitions in the order they were applied.
    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register a new task in `waiting`
    pub fn add(&self, file_name: &str, file_size: u64) -> TaskHandle {
        let handle = {
            let mut inner = self.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;

            let cancel = CancellationToken::new();
            let task = UploadTask {
                id,
                file_name: file_name.to_string(),
                file_size,
                progress: 0,
                speed: 0.0,
                status: TaskStatus::Waiting,
                message: String::new(),
                processed_bytes: 0,
                last_update: Utc::now(),
                location: None,
                attempt: 0,
            };
            inner.entries.insert(
                id,
                Entry {
                    task: task.clone(),
                    cancel: cancel.clone(),
                },
            );
            self.emit(TaskEvent::Updated(task));
            TaskHandle {
                id,
                attempt: 0,
                cancel,
            }
        };

        debug!(task = handle.id, file = %file_name, size = file_size, "Task added");
        handle
    }

    pub fn get(&self, id: TaskId) -> Option<UploadTask> {
        self.inner.read().entries.get(&id).map(|e| e.task.clone())
    }

    /// All tasks in submission order
    pub fn list(&self) -> Vec<UploadTask> {
        self.inner
            .read()
            .entries
            .values()
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn stats(&self) -> UploadStats {
        let inner = self.inner.read();
        let mut stats = UploadStats {
            total: inner.entries.len(),
            ..Default::default()
        };
        for entry in inner.entries.values() {
            match entry.task.status {
                TaskStatus::Success => stats.completed += 1,
                TaskStatus::Error => stats.failed += 1,
                _ => stats.uploading += 1,
            }
        }
        stats
    }

    /// Apply `f` to the task owned by `handle` if the attempt is current and
    /// the task is in one of `allowed`.
    fn transition<F>(&self, handle: &TaskHandle, allowed: &[TaskStatus], f: F) -> bool
    where
        F: FnOnce(&mut UploadTask),
    {
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(&handle.id) else {
            return false;
        };
        if entry.task.attempt != handle.attempt || !allowed.contains(&entry.task.status) {
            return false;
        }
        f(&mut entry.task);
        entry.task.last_update = Utc::now();
        self.emit(TaskEvent::Updated(entry.task.clone()));
        true
    }

    /// Move a `waiting` task to `uploading` once chunks are about to move
    pub fn start(&self, handle: &TaskHandle) -> bool {
        self.transition(handle, &[TaskStatus::Waiting], |task| {
            task.status = TaskStatus::Uploading;
            task.message = String::new();
        })
    }

    /// Record transfer progress of an `uploading` task.
    ///
    /// Reaching 100% moves it to `merging`. Progress never decreases within
    /// an attempt.
    pub fn update_progress(&self, handle: &TaskHandle, processed_bytes: u64, speed: f64) -> bool {
        self.transition(
            handle,
            &[TaskStatus::Uploading],
            |task| {
                let processed = processed_bytes.min(task.file_size).max(task.processed_bytes);
                task.processed_bytes = processed;
                task.progress = percent(processed, task.file_size);
                task.speed = speed;
                if task.progress >= 100 {
                    task.status = TaskStatus::Merging;
                    task.message = "merging chunks".to_string();
                }
            },
        )
    }

    /// Set an informational message without changing state
    pub fn set_message(&self, handle: &TaskHandle, message: &str) -> bool {
        self.transition(
            handle,
            &[TaskStatus::Waiting, TaskStatus::Uploading, TaskStatus::Merging],
            |task| task.message = message.to_string(),
        )
    }

    /// Mark the attempt successful
    pub fn complete(&self, handle: &TaskHandle, location: &str) -> bool {
        let applied = self.transition(
            handle,
            &[TaskStatus::Waiting, TaskStatus::Uploading, TaskStatus::Merging],
            |task| {
                task.status = TaskStatus::Success;
                task.progress = 100;
                task.processed_bytes = task.file_size;
                task.speed = 0.0;
                task.message = String::new();
                task.location = Some(location.to_string());
            },
        );
        if applied {
            info!(task = handle.id, location = %location, "Upload succeeded");
        }
        applied
    }

    /// Mark the attempt failed with `message`
    pub fn fail(&self, handle: &TaskHandle, message: &str) -> bool {
        let applied = self.transition(
            handle,
            &[TaskStatus::Waiting, TaskStatus::Uploading, TaskStatus::Merging],
            |task| {
                task.status = TaskStatus::Error;
                task.speed = 0.0;
                task.message = message.to_string();
            },
        );
        if applied {
            warn!(task = handle.id, reason = %message, "Upload failed");
        }
        applied
    }

    /// Cancel a task.
    ///
    /// Active tasks fail with [`CANCELLED_MESSAGE`] and their pipeline is
    /// signalled. Successful tasks are removed. Failed tasks are left alone.
    pub fn cancel(&self, id: TaskId) -> CancelOutcome {
        let outcome = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return CancelOutcome::NotFound;
            };
            let status = entry.task.status;
            match status {
                TaskStatus::Error => return CancelOutcome::Unchanged,
                TaskStatus::Success => {
                    inner.entries.remove(&id);
                    self.emit(TaskEvent::Removed(id));
                    CancelOutcome::Removed
                }
                _ => {
                    entry.cancel.cancel();
                    entry.task.status = TaskStatus::Error;
                    entry.task.speed = 0.0;
                    entry.task.message = CANCELLED_MESSAGE.to_string();
                    entry.task.last_update = Utc::now();
                    self.emit(TaskEvent::Updated(entry.task.clone()));
                    CancelOutcome::Cancelled
                }
            }
        };

        debug!(task = id, outcome = ?outcome, "Cancel requested");
        outcome
    }

    /// Cancel every active task; finished tasks are untouched
    pub fn cancel_all(&self) -> usize {
        let active: Vec<TaskId> = self
            .inner
            .read()
            .entries
            .values()
            .filter(|e| e.task.status.is_active())
            .map(|e| e.task.id)
            .collect();

        active
            .into_iter()
            .filter(|id| self.cancel(*id) == CancelOutcome::Cancelled)
            .count()
    }

    /// Re-enter `waiting` from `error` with progress reset.
    ///
    /// Returns a handle for the new attempt.
    pub fn retry(&self, id: TaskId) -> Result<TaskHandle> {
        let handle = {
            let mut inner = self.inner.write();
            let entry = inner.entries.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
            if entry.task.status != TaskStatus::Error {
                return Err(Error::InvalidArgument(format!(
                    "task {} is {}, only failed tasks can be retried",
                    id, entry.task.status
                )));
            }

            let cancel = CancellationToken::new();
            entry.cancel = cancel.clone();
            let task = &mut entry.task;
            task.attempt += 1;
            task.status = TaskStatus::Waiting;
            task.progress = 0;
            task.processed_bytes = 0;
            task.speed = 0.0;
            task.message = String::new();
            task.location = None;
            task.last_update = Utc::now();

            self.emit(TaskEvent::Updated(task.clone()));
            TaskHandle {
                id,
                attempt: task.attempt,
                cancel,
            }
        };

        info!(task = id, attempt = handle.attempt, "Retrying upload");
        Ok(handle)
    }

    /// Ids of failed tasks, for bulk retry
    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| e.task.status == TaskStatus::Error)
            .map(|e| e.task.id)
            .collect()
    }

    /// Remove every successful task
    pub fn clear_completed(&self) -> usize {
        let mut inner = self.inner.write();
        let removed: Vec<TaskId> = inner
            .entries
            .values()
            .filter(|e| e.task.status == TaskStatus::Success)
            .map(|e| e.task.id)
            .collect();
        for id in &removed {
            inner.entries.remove(id);
            self.emit(TaskEvent::Removed(*id));
        }
        removed.len()
    }
}
