use crate::config::BusConfig;
use crate::events::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    AgentRegistry, ConductorError, ConductorResult, Metric, MonitoringService,
};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A point-to-point message between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: Uuid,
    /// Sending agent.
    pub from: String,
    /// Receiving agent.
    pub to: String,
    /// Routing key for handlers.
    pub message_type: String,
    /// Opaque body.
    pub payload: serde_json::Value,
    /// Send time.
    pub timestamp: DateTime<Utc>,
    /// Set when the message was fanned out from a topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl Message {
    fn new(
        from: &str,
        to: &str,
        message_type: &str,
        payload: serde_json::Value,
        topic: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.to_string(),
            to: to.to_string(),
            message_type: message_type.to_string(),
            payload,
            timestamp: Utc::now(),
            topic: topic.map(str::to_string),
        }
    }
}

/// Receives messages of one type for one agent.
///
/// Errors and panics are both contained by the bus and reported as handler
/// failures. Builds with `panic = "abort"` cannot contain panics.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. Errors are reported by the bus, never returned to the sender.
    async fn handle(&self, message: &Message) -> ConductorResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> ConductorResult<()> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> ConductorResult<()> {
        (self.0)(message)
    }
}

/// Wrap a synchronous closure as a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&Message) -> ConductorResult<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-recipient delivery predicate. Returning `false` vetoes handler delivery.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Notifications published by the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A message was recorded for its recipient.
    MessageSent {
        /// Message id.
        message_id: Uuid,
        /// Sending agent.
        from: String,
        /// Receiving agent.
        to: String,
        /// Routing key.
        message_type: String,
    },
    /// A filter vetoed handler delivery.
    MessageFiltered {
        /// Message id.
        message_id: Uuid,
        /// Receiving agent.
        to: String,
    },
    /// A handler returned an error or panicked.
    HandlerFailed {
        /// Message id.
        message_id: Uuid,
        /// Agent owning the handler.
        agent_id: String,
        /// Failure text.
        error: String,
    },
    /// A topic was created.
    TopicCreated {
        /// Topic name.
        topic: String,
    },
    /// A topic was deleted.
    TopicDeleted {
        /// Topic name.
        topic: String,
    },
}

#[derive(Default)]
struct BusState {
    history: HashMap<String, VecDeque<Message>>,
    handlers: HashMap<(String, String), Vec<(Uuid, Arc<dyn MessageHandler>)>>,
    filters: HashMap<String, Vec<(Uuid, MessageFilter)>>,
    topics: BTreeMap<String, Vec<String>>,
}

/// Point-to-point and topic messaging between registered agents.
///
/// Handlers run in subscription order on the sender's task, after the message
/// is recorded in the recipient's history. A failing handler is logged and
/// metered; it never stops the remaining handlers or fails the send.
pub struct CommunicationBus {
    config: BusConfig,
    state: RwLock<BusState>,
    registry: Arc<dyn AgentRegistry>,
    monitoring: Arc<dyn MonitoringService>,
    events: EventBus<BusEvent>,
}

impl CommunicationBus {
    /// Bus routing to agents known to `registry`.
    pub fn new(
        config: BusConfig,
        registry: Arc<dyn AgentRegistry>,
        monitoring: Arc<dyn MonitoringService>,
    ) -> Self {
        Self {
            config,
            state: RwLock::new(BusState::default()),
            registry,
            monitoring,
            events: EventBus::default(),
        }
    }

    /// Receive bus notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Send a message to a registered agent. Unknown recipients are rejected
    /// without touching any history.
    pub async fn send_message(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: serde_json::Value,
    ) -> ConductorResult<Message> {
        self.deliver(Message::new(from, to, message_type, payload, None))
            .await
    }

    /// Send to every registered agent except `exclude`. Returns how many
    /// recipients the message was delivered to.
    pub async fn broadcast_message(
        &self,
        from: &str,
        message_type: &str,
        payload: serde_json::Value,
        exclude: Option<&str>,
    ) -> usize {
        let mut delivered = 0;
        for (agent_id, _) in self.registry.all_agents().await {
            if exclude == Some(agent_id.as_str()) {
                continue;
            }
            match self
                .send_message(from, &agent_id, message_type, payload.clone())
                .await
            {
                Ok(_) => delivered += 1,
                Err(e) => warn!(to = %agent_id, error = %e, "Broadcast delivery failed"),
            }
        }
        debug!(from = %from, message_type = %message_type, delivered, "Broadcast sent");
        delivered
    }

    /// Register a handler for `(agent_id, message_type)`.
    pub async fn subscribe(
        &self,
        agent_id: &str,
        message_type: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state
            .write()
            .await
            .handlers
            .entry((agent_id.to_string(), message_type.to_string()))
            .or_default()
            .push((id, handler));
        debug!(agent_id = %agent_id, message_type = %message_type, subscription = %id, "Handler subscribed");
        id
    }

    /// Remove one handler, or every handler for the type when
    /// `subscription` is `None`. Returns how many were removed.
    pub async fn unsubscribe(
        &self,
        agent_id: &str,
        message_type: &str,
        subscription: Option<Uuid>,
    ) -> usize {
        let mut state = self.state.write().await;
        let key = (agent_id.to_string(), message_type.to_string());
        let Some(handlers) = state.handlers.get_mut(&key) else {
            return 0;
        };
        let before = handlers.len();
        match subscription {
            Some(id) => handlers.retain(|(sid, _)| *sid != id),
            None => handlers.clear(),
        }
        let removed = before - handlers.len();
        if handlers.is_empty() {
            state.handlers.remove(&key);
        }
        removed
    }

    /// Add a delivery predicate for an agent. Returns the id used to remove it.
    pub async fn add_message_filter(&self, agent_id: &str, filter: MessageFilter) -> Uuid {
        let id = Uuid::new_v4();
        self.state
            .write()
            .await
            .filters
            .entry(agent_id.to_string())
            .or_default()
            .push((id, filter));
        id
    }

    /// Remove a filter. Returns `false` for unknown ids.
    pub async fn remove_message_filter(&self, agent_id: &str, filter_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        let Some(filters) = state.filters.get_mut(agent_id) else {
            return false;
        };
        let before = filters.len();
        filters.retain(|(id, _)| *id != filter_id);
        let removed = filters.len() < before;
        if filters.is_empty() {
            state.filters.remove(agent_id);
        }
        removed
    }

    /// Create a topic. Returns `false` if it already exists.
    pub async fn create_topic(&self, topic: &str) -> bool {
        let created = {
            let mut state = self.state.write().await;
            if state.topics.contains_key(topic) {
                false
            } else {
                state.topics.insert(topic.to_string(), Vec::new());
                true
            }
        };
        if created {
            info!(topic = %topic, "Topic created");
            self.events.publish(BusEvent::TopicCreated {
                topic: topic.to_string(),
            });
        }
        created
    }

    /// Remove a topic and its subscriptions. Returns `false` for unknown topics.
    pub async fn delete_topic(&self, topic: &str) -> bool {
        let deleted = self.state.write().await.topics.remove(topic).is_some();
        if deleted {
            info!(topic = %topic, "Topic deleted");
            self.events.publish(BusEvent::TopicDeleted {
                topic: topic.to_string(),
            });
        }
        deleted
    }

    /// Add an agent to a topic. Subscribing twice is a no-op.
    pub async fn subscribe_to_topic(&self, topic: &str, agent_id: &str) -> ConductorResult<()> {
        let mut state = self.state.write().await;
        let subscribers = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| ConductorError::NotFound(format!("topic {topic}")))?;
        if !subscribers.iter().any(|s| s == agent_id) {
            subscribers.push(agent_id.to_string());
        }
        Ok(())
    }

    /// Leave a topic. Returns `false` when not subscribed.
    pub async fn unsubscribe_from_topic(&self, topic: &str, agent_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(subscribers) = state.topics.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s != agent_id);
        subscribers.len() < before
    }

    /// Send one message per current subscriber. Returns how many were
    /// delivered.
    pub async fn publish_to_topic(
        &self,
        topic: &str,
        from: &str,
        message_type: &str,
        payload: serde_json::Value,
    ) -> ConductorResult<usize> {
        let subscribers = self
            .topic_subscribers(topic)
            .await
            .ok_or_else(|| ConductorError::NotFound(format!("topic {topic}")))?;

        let mut delivered = 0;
        for agent_id in subscribers {
            let message = Message::new(from, &agent_id, message_type, payload.clone(), Some(topic));
            match self.deliver(message).await {
                Ok(_) => delivered += 1,
                Err(e) => warn!(topic = %topic, to = %agent_id, error = %e, "Topic delivery failed"),
            }
        }
        Ok(delivered)
    }

    /// Topic names, sorted.
    pub async fn topics(&self) -> Vec<String> {
        self.state.read().await.topics.keys().cloned().collect()
    }

    /// Subscribers of a topic; `None` for unknown topics.
    pub async fn topic_subscribers(&self, topic: &str) -> Option<Vec<String>> {
        self.state.read().await.topics.get(topic).cloned()
    }

    /// Messages received by an agent, oldest first; `limit` keeps the newest.
    pub async fn message_history(&self, agent_id: &str, limit: Option<usize>) -> Vec<Message> {
        let state = self.state.read().await;
        let Some(history) = state.history.get(agent_id) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |l| history.len().saturating_sub(l));
        history.iter().skip(skip).cloned().collect()
    }

    /// Drop an agent's history. Returns how many messages were removed.
    pub async fn clear_history(&self, agent_id: &str) -> usize {
        self.state
            .write()
            .await
            .history
            .remove(agent_id)
            .map_or(0, |h| h.len())
    }

    async fn deliver(&self, message: Message) -> ConductorResult<Message> {
        if self.registry.get_agent(&message.to).await.is_none() {
            warn!(from = %message.from, to = %message.to, message_type = %message.message_type, "Message to unknown agent dropped");
            return Err(ConductorError::NotFound(format!("agent {}", message.to)));
        }

        let (filters, handlers) = {
            let mut state = self.state.write().await;
            let history = state.history.entry(message.to.clone()).or_default();
            history.push_back(message.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }

            let filters: Vec<MessageFilter> = state
                .filters
                .get(&message.to)
                .map(|f| f.iter().map(|(_, filter)| Arc::clone(filter)).collect())
                .unwrap_or_default();
            let handlers: Vec<Arc<dyn MessageHandler>> = state
                .handlers
                .get(&(message.to.clone(), message.message_type.clone()))
                .map(|h| h.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default();
            (filters, handlers)
        };

        debug!(
            message_id = %message.id,
            from = %message.from,
            to = %message.to,
            message_type = %message.message_type,
            "Message sent"
        );
        self.events.publish(BusEvent::MessageSent {
            message_id: message.id,
            from: message.from.clone(),
            to: message.to.clone(),
            message_type: message.message_type.clone(),
        });

        if !filters.iter().all(|filter| filter(&message)) {
            debug!(message_id = %message.id, to = %message.to, "Message vetoed by filter");
            self.events.publish(BusEvent::MessageFiltered {
                message_id: message.id,
                to: message.to.clone(),
            });
            return Ok(message);
        }

        for handler in handlers {
            let error = match AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
            };
            warn!(
                message_id = %message.id,
                agent_id = %message.to,
                message_type = %message.message_type,
                error = %error,
                "Message handler failed"
            );
            self.monitoring
                .record_metric(
                    &message.to,
                    Metric::count("message_handler_error")
                        .with_meta("message_type", message.message_type.clone())
                        .with_meta("error", error.clone()),
                )
                .await;
            self.events.publish(BusEvent::HandlerFailed {
                message_id: message.id,
                agent_id: message.to.clone(),
                error,
            });
        }
        Ok(message)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
