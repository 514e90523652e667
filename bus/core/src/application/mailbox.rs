// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Inbox
//!
//! Point-to-point message delivery between registered agents. Each message
//! is stored once under `message:{id}` with the mailbox TTL; the recipient's
//! `inbox:{agent}` list keeps arrival order and `inbox:{agent}:unread` tracks
//! which ids have not been received yet. Records are never rewritten to flip
//! the read flag; it is derived from unread-set membership. Receives on the
//! same inbox serialize, so a message is handed out as unread at most once.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::application::agent_registry::AgentRegistry;
use crate::application::task_store::TaskStore;
use crate::domain::agent::AgentId;
use crate::domain::bus_config::MailboxConfig;
use crate::domain::error::BusError;
use crate::domain::events::BusEvent;
use crate::domain::message::{InboxMessage, Message, MessageId};
use crate::domain::storage::{read_json, write_json, Keyspace, Storage};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::keyed_lock::KeyedLocks;

pub struct Mailbox {
    storage: Arc<dyn Storage>,
    keys: Keyspace,
    config: MailboxConfig,
    agents: Arc<AgentRegistry>,
    tasks: Arc<TaskStore>,
    events: EventBus,
    inbox_locks: KeyedLocks<AgentId>,
}

impl Mailbox {
    pub fn new(
        storage: Arc<dyn Storage>,
        keys: Keyspace,
        config: MailboxConfig,
        agents: Arc<AgentRegistry>,
        tasks: Arc<TaskStore>,
        events: EventBus,
    ) -> Self {
        Self {
            storage,
            keys,
            config,
            agents,
            tasks,
            events,
            inbox_locks: KeyedLocks::new(),
        }
    }

    /// Deliver `message` into `to`'s inbox. A message naming a task is also
    /// appended to that task's history.
    pub async fn send(
        &self,
        from: Option<AgentId>,
        to: AgentId,
        message: Message,
    ) -> Result<InboxMessage, BusError> {
        message.validate()?;
        self.agents.get(to).await?;
        if let Some(sender) = from {
            self.agents.get(sender).await?;
        }

        let message = match message.task_id {
            Some(task_id) => self.tasks.append_message(task_id, message).await?,
            None => message,
        };

        let envelope = InboxMessage {
            id: MessageId::new(),
            from_agent_id: from,
            to_agent_id: to,
            message,
            created_at: Utc::now(),
            read: false,
        };
        let ttl = Some(self.config.ttl);
        let id = envelope.id.to_string();
        write_json(self.storage.as_ref(), &self.keys.message(&id), &envelope, ttl).await?;
        self.storage.list_push(&self.keys.inbox(to), &id, ttl).await?;
        self.storage.set_add(&self.keys.inbox_unread(to), &id).await?;

        info!(
            message_id = %envelope.id,
            to_agent_id = %to,
            from_agent_id = ?from,
            "Message delivered"
        );
        self.events.publish(BusEvent::MessageDelivered {
            message_id: envelope.id,
            to_agent_id: to,
            at: envelope.created_at,
        });
        Ok(envelope)
    }

    /// Unread messages in arrival order, at most `limit` (default from config)
    pub async fn receive(
        &self,
        agent_id: AgentId,
        mark_as_read: bool,
        limit: Option<usize>,
    ) -> Result<Vec<InboxMessage>, BusError> {
        let limit = limit.unwrap_or(self.config.receive_limit);
        let _guard = self.inbox_locks.lock(agent_id).await;
        let unread_key = self.keys.inbox_unread(agent_id);
        let unread: HashSet<String> = self.storage.set_members(&unread_key).await?.into_iter().collect();
        if unread.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut received = Vec::new();
        for id in self.storage.list_range(&self.keys.inbox(agent_id), 0, None).await? {
            if received.len() == limit {
                break;
            }
            if !unread.contains(&id) {
                continue;
            }
            match read_json::<InboxMessage>(self.storage.as_ref(), &self.keys.message(&id)).await? {
                Some(mut envelope) => {
                    if mark_as_read {
                        self.storage.set_remove(&unread_key, &id).await?;
                        envelope.read = true;
                    }
                    received.push(envelope);
                }
                None => {
                    self.storage.set_remove(&unread_key, &id).await?;
                }
            }
        }

        debug!(agent_id = %agent_id, count = received.len(), mark_as_read, "Inbox read");
        Ok(received)
    }

    /// Every live message in the inbox, read or not
    pub async fn all_messages(&self, agent_id: AgentId) -> Result<Vec<InboxMessage>, BusError> {
        let unread: HashSet<String> = self
            .storage
            .set_members(&self.keys.inbox_unread(agent_id))
            .await?
            .into_iter()
            .collect();

        let mut messages = Vec::new();
        for id in self.storage.list_range(&self.keys.inbox(agent_id), 0, None).await? {
            if let Some(mut envelope) =
                read_json::<InboxMessage>(self.storage.as_ref(), &self.keys.message(&id)).await?
            {
                envelope.read = !unread.contains(&id);
                messages.push(envelope);
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentManifest;
    use crate::domain::task::{CreateTask, TaskState};
    use crate::infrastructure::storage::MemoryStorage;
    use std::time::Duration;

    struct Fixture {
        mailbox: Arc<Mailbox>,
        agents: Arc<AgentRegistry>,
        tasks: Arc<TaskStore>,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let keys = Keyspace::default();
        let events = EventBus::new(64);
        let agents = Arc::new(AgentRegistry::new(
            storage.clone(),
            keys.clone(),
            Duration::from_secs(60),
            events.clone(),
        ));
        let tasks = Arc::new(TaskStore::new(
            storage.clone(),
            keys.clone(),
            Duration::from_secs(3600),
            50,
            events.clone(),
        ));
        let config = MailboxConfig {
            ttl,
            receive_limit: 100,
        };
        Fixture {
            mailbox: Arc::new(Mailbox::new(storage, keys, config, agents.clone(), tasks.clone(), events)),
            agents,
            tasks,
        }
    }

    #[tokio::test]
    async fn test_receive_marks_read_in_arrival_order() {
        let f = fixture(Duration::from_secs(60));
        let alice = f.agents.register(AgentManifest::new("alice", "1")).await.unwrap();
        let bob = f.agents.register(AgentManifest::new("bob", "1")).await.unwrap();

        for text in ["one", "two", "three"] {
            f.mailbox.send(Some(alice), bob, Message::user_text(text)).await.unwrap();
        }

        let first = f.mailbox.receive(bob, true, Some(2)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].message.parts, Message::user_text("one").parts);
        assert!(first.iter().all(|m| m.read && m.from_agent_id == Some(alice)));

        let rest = f.mailbox.receive(bob, true, None).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(f.mailbox.receive(bob, true, None).await.unwrap().is_empty());

        let all = f.mailbox.all_messages(bob).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|m| m.read));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_receivers_never_share_a_message() {
        let f = fixture(Duration::from_secs(60));
        let bob = f.agents.register(AgentManifest::new("bob", "1")).await.unwrap();
        for i in 0..200 {
            f.mailbox.send(None, bob, Message::user_text(format!("m{}", i))).await.unwrap();
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mailbox = f.mailbox.clone();
                tokio::spawn(async move {
                    let mut ids = Vec::new();
                    loop {
                        let batch = mailbox.receive(bob, true, Some(7)).await.unwrap();
                        if batch.is_empty() {
                            break ids;
                        }
                        ids.extend(batch.into_iter().map(|m| m.id));
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for reader in readers {
            for id in reader.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "message {} was received twice", id);
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn test_peek_leaves_messages_unread() {
        let f = fixture(Duration::from_secs(60));
        let bob = f.agents.register(AgentManifest::new("bob", "1")).await.unwrap();
        f.mailbox.send(None, bob, Message::user_text("ping")).await.unwrap();

        assert_eq!(f.mailbox.receive(bob, false, None).await.unwrap().len(), 1);
        let again = f.mailbox.receive(bob, false, None).await.unwrap();
        assert_eq!(again.len(), 1);
        assert!(!again[0].read);
    }

    #[tokio::test]
    async fn test_unknown_parties_are_rejected() {
        let f = fixture(Duration::from_secs(60));
        let bob = f.agents.register(AgentManifest::new("bob", "1")).await.unwrap();

        let err = f.mailbox.send(None, AgentId::new(), Message::user_text("x")).await.unwrap_err();
        assert!(err.is_not_found());
        let err = f.mailbox.send(Some(AgentId::new()), bob, Message::user_text("x")).await.unwrap_err();
        assert!(err.is_not_found());
        let err = f
            .mailbox
            .send(None, bob, Message::new(crate::domain::message::Role::User, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_task_messages_land_in_history() {
        let f = fixture(Duration::from_secs(60));
        let bob = f.agents.register(AgentManifest::new("bob", "1")).await.unwrap();
        let task = f.tasks.create(CreateTask::default()).await.unwrap();

        let mut message = Message::agent_text("progress");
        message.task_id = Some(task.id);
        let delivered = f.mailbox.send(None, bob, message).await.unwrap();
        assert_eq!(delivered.message.context_id, Some(task.context_id.clone()));

        let task = f.tasks.get(task.id, None).await.unwrap();
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.state(), TaskState::Submitted);

        let mut orphan = Message::agent_text("lost");
        orphan.task_id = Some(crate::domain::task::TaskId::new());
        assert!(f.mailbox.send(None, bob, orphan).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_expired_messages_disappear() {
        let f = fixture(Duration::from_millis(20));
        let bob = f.agents.register(AgentManifest::new("bob", "1")).await.unwrap();
        f.mailbox.send(None, bob, Message::user_text("soon gone")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(f.mailbox.receive(bob, true, None).await.unwrap().is_empty());
        assert!(f.mailbox.all_messages(bob).await.unwrap().is_empty());
    }
}
