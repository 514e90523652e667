// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Bus Events
//
// In-memory event streaming over a tokio broadcast channel. Observers
// (dashboards, audit sinks, tests) subscribe; publishers never block and
// never fail when nobody is listening. Events are lost on restart.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::agent::AgentId;
use crate::domain::events::BusEvent;

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BusEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before slow
    /// receivers start lagging
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: BusEvent) {
        debug!(event_type = event.event_type(), "Publishing event");

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events concerning a single agent
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<BusEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<BusEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<BusEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one agent: its registration, removal, sessions and
/// inbox deliveries
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<BusEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    pub async fn recv(&mut self) -> Result<BusEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &BusEvent) -> bool {
        match event {
            BusEvent::AgentRegistered { agent_id, .. } | BusEvent::AgentRemoved { agent_id, .. } => {
                *agent_id == self.agent_id
            }
            BusEvent::SessionOpened { key, .. } | BusEvent::SessionClosed { key, .. } => {
                key.agent_id == self.agent_id
            }
            BusEvent::MessageDelivered { to_agent_id, .. } => *to_agent_id == self.agent_id,
            _ => false,
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus closed")]
    Closed,
    #[error("receiver lagged by {0} events")]
    Lagged(u64),
    #[error("no events available")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::app::AppId;
    use crate::domain::session::{SessionCloseReason, SessionKey};
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();
        let agent_id = AgentId::new();

        bus.publish(BusEvent::AgentRegistered {
            agent_id,
            name: "planner".to_string(),
            renewed: false,
            at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            BusEvent::AgentRegistered { agent_id: id, .. } => assert_eq!(id, agent_id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_filter() {
        let bus = EventBus::new(16);
        let agent_id = AgentId::new();
        let mut receiver = bus.subscribe_agent(agent_id);

        bus.publish(BusEvent::SessionOpened {
            key: SessionKey::new(AgentId::new(), AppId::new()),
            at: Utc::now(),
        });
        bus.publish(BusEvent::SessionClosed {
            key: SessionKey::new(agent_id, AppId::new()),
            reason: SessionCloseReason::Expired,
            at: Utc::now(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "session_closed");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(BusEvent::AgentRemoved {
            agent_id: AgentId::new(),
            reason: crate::domain::events::AgentRemovalReason::Expired,
            at: Utc::now(),
        });
    }
}
