use crate::bus::{AgentMessage, BusRejection, EventBus, MessageDraft, SubscriptionId};
use orkestra_core::AgentRole;
use parking_lot::Mutex;
use std::sync::Arc;

/// A single agent's view of the bus.
///
/// Every message sent through the mailbox carries the bound identity and
/// role, so an agent cannot impersonate another. Subscriptions made through
/// the mailbox are released together by [`AgentMailbox::dispose`] or on drop.
pub struct AgentMailbox {
    bus: Arc<EventBus>,
    agent_id: String,
    role: AgentRole,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl AgentMailbox {
    pub fn new(bus: Arc<EventBus>, agent_id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            bus,
            agent_id: agent_id.into(),
            role,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Broadcast on `topic`.
    pub fn send(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<AgentMessage, BusRejection> {
        self.bus.publish(self.draft(topic, payload))
    }

    /// Send on `topic` to a single agent.
    pub fn send_to(
        &self,
        target: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<AgentMessage, BusRejection> {
        self.bus.publish(self.draft(topic, payload).to(target))
    }

    /// Answer `original`, targeting its sender and correlating by its id.
    pub fn reply(
        &self,
        original: &AgentMessage,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<AgentMessage, BusRejection> {
        self.bus.publish(
            self.draft(topic, payload)
                .to(original.sender.clone())
                .correlation(original.id.to_string()),
        )
    }

    /// Subscribe with this agent's identity.
    pub fn on<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId, BusRejection>
    where
        F: Fn(&AgentMessage) + Send + Sync + 'static,
    {
        let id = self
            .bus
            .subscribe(self.agent_id.clone(), self.role, pattern, handler)?;
        self.subscriptions.lock().push(id);
        Ok(id)
    }

    /// Unexpired messages addressed to this agent or broadcast.
    pub fn inbox(&self) -> Vec<AgentMessage> {
        self.bus.get_messages_for(&self.agent_id)
    }

    /// Unexpired messages on `topic` (wildcards allowed).
    pub fn read(&self, topic: &str) -> Vec<AgentMessage> {
        self.bus.get_messages(Some(topic))
    }

    /// Release every subscription made through this mailbox.
    pub fn dispose(&self) -> usize {
        let ids: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        ids.into_iter().filter(|id| self.bus.unsubscribe(*id)).count()
    }

    fn draft(&self, topic: &str, payload: serde_json::Value) -> MessageDraft {
        MessageDraft::new(self.agent_id.clone(), self.role, topic, payload)
    }
}

impl Drop for AgentMailbox {
    fn drop(&mut self) {
        self.dispose();
    }
}
