use orkestra_core::AgentRole;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// What a role is trying to do with a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Publish,
    Subscribe,
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclAction::Publish => f.write_str("publish"),
            AclAction::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// A topic or subscription pattern. Only a trailing `*` is a wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    /// `*`: every topic.
    All,
    /// `task.*`: every topic starting with `task.`.
    Prefix(String),
    /// An exact topic.
    Exact(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some("") => TopicPattern::All,
            Some(prefix) => TopicPattern::Prefix(prefix.to_string()),
            None => TopicPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::All => true,
            TopicPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicPattern::Exact(exact) => topic == exact,
        }
    }

    /// The fixed leading part every matching topic shares.
    fn stem(&self) -> &str {
        match self {
            TopicPattern::All => "",
            TopicPattern::Prefix(p) | TopicPattern::Exact(p) => p,
        }
    }
}

/// Roles permitted to publish and subscribe under one topic prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRule {
    pub prefix: String,
    pub publish: HashSet<AgentRole>,
    pub subscribe: HashSet<AgentRole>,
}

impl TopicRule {
    pub fn new(
        prefix: impl Into<String>,
        publish: impl IntoIterator<Item = AgentRole>,
        subscribe: impl IntoIterator<Item = AgentRole>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            publish: publish.into_iter().collect(),
            subscribe: subscribe.into_iter().collect(),
        }
    }

    fn allows(&self, action: AclAction, role: AgentRole) -> bool {
        match action {
            AclAction::Publish => self.publish.contains(&role),
            AclAction::Subscribe => self.subscribe.contains(&role),
        }
    }
}

/// Role-based access control over topic prefixes.
///
/// A topic is permitted when some rule's prefix covers it and that rule
/// grants the role the action. Topics no rule covers are denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicAcl {
    rules: Vec<TopicRule>,
}

impl TopicAcl {
    /// An empty table: everything is denied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every role may do everything on every topic.
    pub fn allow_all() -> Self {
        Self::new().with_rule(TopicRule::new("", AgentRole::ALL, AgentRole::ALL))
    }

    /// The built-in role table.
    pub fn default_table() -> Self {
        use AgentRole::*;
        let everyone = AgentRole::ALL;
        let actors = [
            Orchestrator,
            Planner,
            Coder,
            Auditor,
            Tester,
            Reviewer,
            Deployer,
        ];
        Self::new()
            .with_rule(TopicRule::new("task.", [Orchestrator], everyone))
            .with_rule(TopicRule::new("system.", [Orchestrator], everyone))
            .with_rule(TopicRule::new("agent.", actors, everyone))
            .with_rule(TopicRule::new("coord.", actors, everyone))
            .with_rule(TopicRule::new("plan.", [Planner, Orchestrator], everyone))
            .with_rule(TopicRule::new("code.", [Coder, Orchestrator], everyone))
            .with_rule(TopicRule::new("test.", [Tester, Orchestrator], everyone))
            .with_rule(TopicRule::new(
                "review.",
                [Reviewer, Auditor, Orchestrator],
                everyone,
            ))
            .with_rule(TopicRule::new(
                "audit.",
                [Auditor, Orchestrator],
                [Auditor, Orchestrator, Reviewer, Observer],
            ))
            .with_rule(TopicRule::new(
                "deploy.",
                [Deployer, Orchestrator],
                [Deployer, Orchestrator, Reviewer, Observer],
            ))
    }

    pub fn with_rule(mut self, rule: TopicRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[TopicRule] {
        &self.rules
    }

    /// May `role` publish to the concrete `topic`?
    pub fn can_publish(&self, role: AgentRole, topic: &str) -> bool {
        self.rules
            .iter()
            .any(|r| topic.starts_with(r.prefix.as_str()) && r.allows(AclAction::Publish, role))
    }

    /// May `role` subscribe with `pattern`?
    ///
    /// The pattern must fall entirely inside permitted prefixes: `task.*` is
    /// covered by a `task.` rule, while `*` needs every rule to grant the role.
    pub fn can_subscribe(&self, role: AgentRole, pattern: &TopicPattern) -> bool {
        let stem = pattern.stem();
        let covering = self
            .rules
            .iter()
            .any(|r| stem.starts_with(r.prefix.as_str()) && r.allows(AclAction::Subscribe, role));
        if covering {
            return true;
        }
        // A broad pattern is fine if every rule it spans grants the role.
        let spanned: Vec<&TopicRule> = self
            .rules
            .iter()
            .filter(|r| r.prefix.starts_with(stem))
            .collect();
        !matches!(pattern, TopicPattern::Exact(_))
            && !spanned.is_empty()
            && spanned.iter().all(|r| r.allows(AclAction::Subscribe, role))
    }
}
