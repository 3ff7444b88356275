use crate::acl::{AclAction, TopicAcl, TopicPattern};
use chrono::{DateTime, Utc};
use orkestra_core::AgentRole;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bus limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum serialized message size in bytes (default: 10 KiB).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Messages retained in the log before the oldest is evicted (default: 1000).
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// TTL applied when a draft does not set one (default: 5 minutes).
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
}

fn default_max_message_bytes() -> usize {
    10 * 1024
}

fn default_log_capacity() -> usize {
    1000
}

fn default_ttl_ms() -> u64 {
    300_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            log_capacity: default_log_capacity(),
            default_ttl_ms: default_ttl_ms(),
        }
    }
}

/// A published message. Immutable once on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: Uuid,
    pub topic: String,
    pub sender: String,
    pub sender_role: AgentRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Zero means the message never expires.
    pub ttl_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AgentMessage {
    /// Whether the message is past its TTL at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        let age = now.signed_duration_since(self.timestamp).num_milliseconds();
        age >= 0 && age as u64 >= self.ttl_ms
    }

    fn visible_to(&self, agent_id: &str) -> bool {
        self.target.as_deref().map_or(true, |t| t == agent_id)
    }
}

/// A message about to be published.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender: String,
    pub sender_role: AgentRole,
    pub topic: String,
    pub payload: serde_json::Value,
    pub target: Option<String>,
    pub ttl_ms: Option<u64>,
    pub correlation_id: Option<String>,
}

impl MessageDraft {
    pub fn new(
        sender: impl Into<String>,
        sender_role: AgentRole,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sender: sender.into(),
            sender_role,
            topic: topic.into(),
            payload,
            target: None,
            ttl_ms: None,
            correlation_id: None,
        }
    }

    /// Address the message to a single agent.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Why the bus refused a publish or subscribe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusRejection {
    /// The serialized message exceeds the size cap.
    #[error("message is {size} bytes, exceeding the {limit} byte limit")]
    Oversized { size: usize, limit: usize },

    /// The role is not permitted on this topic.
    #[error("role '{role}' is not permitted to {action} on '{topic}'")]
    Unauthorized {
        role: AgentRole,
        action: AclAction,
        topic: String,
    },

    /// Empty or malformed topic.
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Counters exposed for telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub rejected_oversized: u64,
    pub rejected_unauthorized: u64,
    pub evicted: u64,
    pub subscriptions: usize,
    pub retained: usize,
}

type Handler = Arc<dyn Fn(&AgentMessage) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    agent_id: String,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    log: VecDeque<AgentMessage>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
    stats: BusStats,
}

/// Topic-keyed publish/subscribe bus.
///
/// Delivery is synchronous: `publish` invokes every currently registered
/// matching handler before it returns. Late subscribers get no replay; they
/// can read the retained log instead. Handlers run outside the internal lock,
/// so they may publish themselves.
pub struct EventBus {
    config: BusConfig,
    acl: TopicAcl,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(config: BusConfig, acl: TopicAcl) -> Self {
        Self {
            config,
            acl,
            state: Mutex::new(BusState::default()),
        }
    }

    /// A bus with default limits and the built-in role table.
    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default(), TopicAcl::default_table())
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn acl(&self) -> &TopicAcl {
        &self.acl
    }

    /// Validate, log and deliver a message.
    pub fn publish(&self, draft: MessageDraft) -> Result<AgentMessage, BusRejection> {
        if draft.topic.is_empty() || draft.topic.contains('*') {
            return Err(BusRejection::InvalidTopic(draft.topic));
        }

        if !self.acl.can_publish(draft.sender_role, &draft.topic) {
            self.state.lock().stats.rejected_unauthorized += 1;
            warn!(
                sender = %draft.sender,
                role = %draft.sender_role,
                topic = %draft.topic,
                "publish rejected by topic ACL"
            );
            return Err(BusRejection::Unauthorized {
                role: draft.sender_role,
                action: AclAction::Publish,
                topic: draft.topic,
            });
        }

        let message = AgentMessage {
            id: Uuid::new_v4(),
            topic: draft.topic,
            sender: draft.sender,
            sender_role: draft.sender_role,
            target: draft.target,
            payload: draft.payload,
            timestamp: Utc::now(),
            ttl_ms: draft.ttl_ms.unwrap_or(self.config.default_ttl_ms),
            correlation_id: draft.correlation_id,
        };

        let size = serde_json::to_vec(&message).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > self.config.max_message_bytes {
            self.state.lock().stats.rejected_oversized += 1;
            warn!(
                sender = %message.sender,
                topic = %message.topic,
                size,
                limit = self.config.max_message_bytes,
                "publish rejected: message too large"
            );
            return Err(BusRejection::Oversized {
                size,
                limit: self.config.max_message_bytes,
            });
        }

        let handlers: Vec<Handler> = {
            let mut state = self.state.lock();
            state.log.push_back(message.clone());
            while state.log.len() > self.config.log_capacity {
                state.log.pop_front();
                state.stats.evicted += 1;
            }
            state.stats.published += 1;

            let handlers: Vec<Handler> = state
                .subscriptions
                .iter()
                .filter(|s| s.pattern.matches(&message.topic) && message.visible_to(&s.agent_id))
                .map(|s| Arc::clone(&s.handler))
                .collect();
            state.stats.delivered += handlers.len() as u64;
            handlers
        };

        debug!(
            topic = %message.topic,
            sender = %message.sender,
            recipients = handlers.len(),
            "message published"
        );
        for handler in handlers {
            handler(&message);
        }
        Ok(message)
    }

    /// Register a handler for topics matching `pattern` (`"task.*"`, `"*"`, or exact).
    ///
    /// Targeted messages reach only subscriptions registered by their target.
    pub fn subscribe<F>(
        &self,
        agent_id: impl Into<String>,
        role: AgentRole,
        pattern: &str,
        handler: F,
    ) -> Result<SubscriptionId, BusRejection>
    where
        F: Fn(&AgentMessage) + Send + Sync + 'static,
    {
        if pattern.is_empty() {
            return Err(BusRejection::InvalidTopic(pattern.to_string()));
        }
        let parsed = TopicPattern::parse(pattern);
        if !self.acl.can_subscribe(role, &parsed) {
            self.state.lock().stats.rejected_unauthorized += 1;
            return Err(BusRejection::Unauthorized {
                role,
                action: AclAction::Subscribe,
                topic: pattern.to_string(),
            });
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscriptions.push(Subscription {
            id,
            pattern: parsed,
            agent_id: agent_id.into(),
            handler: Arc::new(handler),
        });
        Ok(id)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != id);
        state.subscriptions.len() != before
    }

    /// Unexpired retained messages, optionally filtered by topic pattern.
    pub fn get_messages(&self, topic: Option<&str>) -> Vec<AgentMessage> {
        let pattern = topic.map(TopicPattern::parse);
        let now = Utc::now();
        self.state
            .lock()
            .log
            .iter()
            .filter(|m| !m.is_expired_at(now))
            .filter(|m| pattern.as_ref().map_or(true, |p| p.matches(&m.topic)))
            .cloned()
            .collect()
    }

    /// Unexpired retained messages targeted at `agent_id` or broadcast.
    pub fn get_messages_for(&self, agent_id: &str) -> Vec<AgentMessage> {
        let now = Utc::now();
        self.state
            .lock()
            .log
            .iter()
            .filter(|m| !m.is_expired_at(now) && m.visible_to(agent_id))
            .cloned()
            .collect()
    }

    /// Every retained message, expired or not.
    pub fn retained_len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn stats(&self) -> BusStats {
        let state = self.state.lock();
        BusStats {
            subscriptions: state.subscriptions.len(),
            retained: state.log.len(),
            ..state.stats.clone()
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}
