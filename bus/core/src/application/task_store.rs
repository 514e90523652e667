// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task Store
//!
//! CRUD over tasks plus the validated status lifecycle. The task record and
//! its history list share one TTL, refreshed on every write; the index sets
//! (`tasks`, `tasks:context:{cid}`, `tasks:state:{state}`) never expire and
//! are cleaned lazily when a listed id no longer resolves.
//!
//! Writes to one task serialize on a per-task lock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, info};

use crate::domain::error::{BusError, EntityKind};
use crate::domain::events::BusEvent;
use crate::domain::message::Message;
use crate::domain::storage::{read_json, write_json, Keyspace, Storage, StorageError};
use crate::domain::task::{Artifact, ContextId, CreateTask, Task, TaskId, TaskPage, TaskQuery, TaskState};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::keyed_lock::KeyedLocks;

pub struct TaskStore {
    storage: Arc<dyn Storage>,
    keys: Keyspace,
    ttl: Duration,
    default_list_limit: usize,
    locks: KeyedLocks<TaskId>,
    events: EventBus,
}

impl TaskStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        keys: Keyspace,
        ttl: Duration,
        default_list_limit: usize,
        events: EventBus,
    ) -> Self {
        Self {
            storage,
            keys,
            ttl,
            default_list_limit,
            locks: KeyedLocks::new(),
            events,
        }
    }

    pub async fn create(&self, request: CreateTask) -> Result<Task, BusError> {
        if let Some(message) = &request.initial_message {
            message.validate()?;
        }
        let context_id = request.context_id.unwrap_or_else(ContextId::generate);
        if context_id.as_str().trim().is_empty() {
            return Err(BusError::invalid_input("context_id cannot be empty"));
        }

        let task = Task::new(context_id, request.metadata, Utc::now());
        let _guard = self.locks.lock(task.id).await;
        self.persist(&task).await?;

        if let Some(message) = request.initial_message {
            self.push_history(&task, message).await?;
        }

        let id = task.id.to_string();
        self.storage.set_add(&self.keys.tasks(), &id).await?;
        self.storage.set_add(&self.keys.tasks_by_context(&task.context_id), &id).await?;
        self.storage.set_add(&self.keys.tasks_by_state(task.state()), &id).await?;

        counter!("agentbus_task_transitions_total", "state" => task.state().as_str()).increment(1);
        info!(task_id = %task.id, context_id = %task.context_id, "Task created");
        self.hydrate(task, None).await
    }

    /// Fetch a task; `history_length` limits the view to the most recent entries
    pub async fn get(&self, task_id: TaskId, history_length: Option<usize>) -> Result<Task, BusError> {
        let task = self.load(task_id).await?;
        self.hydrate(task, history_length).await
    }

    /// Tasks matching every given filter, newest first; histories are not loaded
    pub async fn list(&self, query: TaskQuery) -> Result<TaskPage, BusError> {
        let candidates: BTreeSet<String> = match (&query.context_id, query.state) {
            (Some(context_id), Some(state)) => {
                let by_state: BTreeSet<String> = self
                    .storage
                    .set_members(&self.keys.tasks_by_state(state))
                    .await?
                    .into_iter()
                    .collect();
                self.storage
                    .set_members(&self.keys.tasks_by_context(context_id))
                    .await?
                    .into_iter()
                    .filter(|id| by_state.contains(id))
                    .collect()
            }
            (Some(context_id), None) => self
                .storage
                .set_members(&self.keys.tasks_by_context(context_id))
                .await?
                .into_iter()
                .collect(),
            (None, Some(state)) => self
                .storage
                .set_members(&self.keys.tasks_by_state(state))
                .await?
                .into_iter()
                .collect(),
            (None, None) => self.storage.set_members(&self.keys.tasks()).await?.into_iter().collect(),
        };

        let mut tasks = Vec::new();
        for member in candidates {
            let Ok(id) = TaskId::from_string(&member) else {
                continue;
            };
            match read_json::<Task>(self.storage.as_ref(), &self.keys.task(id)).await? {
                Some(task) => {
                    let context_matches = query.context_id.as_ref().is_none_or(|c| *c == task.context_id);
                    let state_matches = query.state.is_none_or(|s| s == task.state());
                    if context_matches && state_matches {
                        tasks.push(task);
                    }
                }
                None => self.forget(&member, &query).await?,
            }
        }

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = tasks.len();
        let limit = query.limit.unwrap_or(self.default_list_limit);
        let tasks = tasks.into_iter().skip(query.offset).take(limit).collect();
        Ok(TaskPage { tasks, total })
    }

    /// Move a task along the status graph, recording `message` in history
    pub async fn update_status(
        &self,
        task_id: TaskId,
        state: TaskState,
        message: Option<Message>,
    ) -> Result<Task, BusError> {
        if let Some(message) = &message {
            message.validate()?;
        }
        let _guard = self.locks.lock(task_id).await;
        let mut task = self.load(task_id).await?;

        let stamped = message.map(|m| task.adopt(m));
        let previous = task.transition(state, stamped.clone(), Utc::now())?;
        self.commit_transition(&task, previous).await?;
        if let Some(message) = stamped {
            self.push_history(&task, message).await?;
        }
        self.hydrate(task, None).await
    }

    /// Append to history without touching the status; returns the stored message
    pub async fn append_message(&self, task_id: TaskId, message: Message) -> Result<Message, BusError> {
        message.validate()?;
        let _guard = self.locks.lock(task_id).await;
        let task = self.load(task_id).await?;
        let stored = self.push_history(&task, message).await?;
        self.storage.expire(&self.keys.task(task_id), self.ttl).await?;
        debug!(task_id = %task_id, message_id = %stored.message_id, "Message appended to task history");
        Ok(stored)
    }

    pub async fn add_artifact(&self, task_id: TaskId, artifact: Artifact) -> Result<Task, BusError> {
        if artifact.parts.is_empty() {
            return Err(BusError::invalid_input(format!(
                "artifact '{}' has no parts",
                artifact.artifact_id
            )));
        }
        let _guard = self.locks.lock(task_id).await;
        let mut task = self.load(task_id).await?;
        task.artifacts.push(artifact);
        self.persist(&task).await?;
        self.hydrate(task, None).await
    }

    /// Cancel from any non-terminal state
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task, BusError> {
        let _guard = self.locks.lock(task_id).await;
        let mut task = self.load(task_id).await?;
        let previous = task.cancel(Utc::now())?;
        self.commit_transition(&task, previous).await?;
        self.hydrate(task, None).await
    }

    pub async fn delete(&self, task_id: TaskId) -> Result<(), BusError> {
        let _guard = self.locks.lock(task_id).await;
        let task = self.load(task_id).await?;
        let id = task_id.to_string();

        self.storage.delete(&self.keys.task(task_id)).await?;
        self.storage.delete(&self.keys.task_history(task_id)).await?;
        self.storage.set_remove(&self.keys.tasks(), &id).await?;
        self.storage.set_remove(&self.keys.tasks_by_context(&task.context_id), &id).await?;
        self.storage.set_remove(&self.keys.tasks_by_state(task.state()), &id).await?;
        info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    async fn commit_transition(&self, task: &Task, previous: TaskState) -> Result<(), BusError> {
        self.persist(task).await?;
        let id = task.id.to_string();
        self.storage.set_remove(&self.keys.tasks_by_state(previous), &id).await?;
        self.storage.set_add(&self.keys.tasks_by_state(task.state()), &id).await?;

        counter!("agentbus_task_transitions_total", "state" => task.state().as_str()).increment(1);
        info!(task_id = %task.id, from = %previous, to = %task.state(), "Task status changed");
        self.events.publish(BusEvent::TaskStatusChanged {
            task_id: task.id,
            context_id: task.context_id.clone(),
            from: previous,
            to: task.state(),
            at: task.status.timestamp,
        });
        Ok(())
    }

    async fn push_history(&self, task: &Task, message: Message) -> Result<Message, BusError> {
        let message = task.adopt(message);
        let raw = serde_json::to_string(&message).map_err(StorageError::from)?;
        self.storage
            .list_push(&self.keys.task_history(task.id), &raw, Some(self.ttl))
            .await?;
        Ok(message)
    }

    async fn persist(&self, task: &Task) -> Result<(), BusError> {
        // History lives in its own list; records only ever hold an empty one
        debug_assert!(task.history.is_empty());
        write_json(self.storage.as_ref(), &self.keys.task(task.id), task, Some(self.ttl)).await?;
        self.storage.expire(&self.keys.task_history(task.id), self.ttl).await?;
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Task, BusError> {
        let mut task: Task = read_json(self.storage.as_ref(), &self.keys.task(task_id))
            .await?
            .ok_or_else(|| BusError::not_found(EntityKind::Task, task_id))?;
        task.history.clear();
        Ok(task)
    }

    async fn hydrate(&self, mut task: Task, history_length: Option<usize>) -> Result<Task, BusError> {
        let key = self.keys.task_history(task.id);
        let offset = match history_length {
            Some(wanted) => {
                let len = usize::try_from(self.storage.list_len(&key).await?).unwrap_or(usize::MAX);
                len.saturating_sub(wanted)
            }
            None => 0,
        };
        task.history = self
            .storage
            .list_range(&key, offset, history_length)
            .await?
            .iter()
            .map(|raw| serde_json::from_str::<Message>(raw))
            .collect::<Result<_, _>>()
            .map_err(StorageError::from)?;
        Ok(task)
    }

    /// Drop a dangling id from the index sets the query touched
    async fn forget(&self, member: &str, query: &TaskQuery) -> Result<(), BusError> {
        self.storage.set_remove(&self.keys.tasks(), member).await?;
        if let Some(context_id) = &query.context_id {
            self.storage.set_remove(&self.keys.tasks_by_context(context_id), member).await?;
        }
        if let Some(state) = query.state {
            self.storage.set_remove(&self.keys.tasks_by_state(state), member).await?;
        }
        Ok(())
    }
}
