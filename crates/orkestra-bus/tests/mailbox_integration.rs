#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Mailbox-level behaviour: identity binding, replies, bulk disposal, and
//! barrier rendezvous driven by bus messages.

use orkestra_bus::{AgentMailbox, Barrier, BusRejection, EventBus, SignalBoard};
use orkestra_core::AgentRole;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

#[test]
fn mailbox_messages_carry_bound_identity() {
    let bus = Arc::new(EventBus::with_defaults());
    let coder = AgentMailbox::new(Arc::clone(&bus), "coder-1", AgentRole::Coder);

    let msg = coder.send("agent.status", json!({"state": "busy"})).unwrap();
    assert_eq!(msg.sender, "coder-1");
    assert_eq!(msg.sender_role, AgentRole::Coder);
    assert_eq!(coder.read("agent.*").len(), 1);
}

#[test]
fn mailbox_cannot_escape_role_permissions() {
    let bus = Arc::new(EventBus::with_defaults());
    let tester = AgentMailbox::new(Arc::clone(&bus), "tester-1", AgentRole::Tester);

    let err = tester.send("task.completed", json!({})).unwrap_err();
    assert!(matches!(err, BusRejection::Unauthorized { .. }));
    assert!(bus.get_messages(None).is_empty());
}

#[test]
fn reply_targets_sender_with_correlation() {
    let bus = Arc::new(EventBus::with_defaults());
    let reviewer = AgentMailbox::new(Arc::clone(&bus), "reviewer-1", AgentRole::Reviewer);
    let coder = AgentMailbox::new(Arc::clone(&bus), "coder-1", AgentRole::Coder);

    let request = coder.send_to("reviewer-1", "agent.request", json!({"pr": 7})).unwrap();
    assert_eq!(reviewer.inbox().len(), 1);

    let answer = reviewer
        .reply(&request, "review.verdict", json!({"approved": true}))
        .unwrap();
    assert_eq!(answer.target.as_deref(), Some("coder-1"));
    assert_eq!(answer.correlation_id, Some(request.id.to_string()));

    let inbox = coder.inbox();
    assert!(inbox.iter().any(|m| m.id == answer.id));
    assert!(!inbox.iter().any(|m| m.id == request.id));
}

#[test]
fn dispose_releases_all_subscriptions() {
    let bus = Arc::new(EventBus::with_defaults());
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let observer = AgentMailbox::new(Arc::clone(&bus), "dash", AgentRole::Observer);
        let s = Arc::clone(&seen);
        observer
            .on("task.*", move |m| s.lock().push(m.topic.clone()))
            .unwrap();
        observer.on("agent.*", |_| {}).unwrap();
        assert_eq!(bus.stats().subscriptions, 2);

        let kernel = AgentMailbox::new(Arc::clone(&bus), "kernel", AgentRole::Orchestrator);
        kernel.send("task.started", json!({"id": "A"})).unwrap();
    }

    assert_eq!(bus.stats().subscriptions, 0);
    assert_eq!(*seen.lock(), vec!["task.started".to_string()]);
}

#[tokio::test]
async fn agents_rendezvous_on_barrier_via_bus() {
    let bus = Arc::new(EventBus::with_defaults());
    let barrier = Arc::new(Barrier::new());
    let signals = Arc::new(SignalBoard::new());
    barrier.create("phase-1", 2).unwrap();

    let b = Arc::clone(&barrier);
    let sig = Arc::clone(&signals);
    let kernel = AgentMailbox::new(Arc::clone(&bus), "kernel", AgentRole::Orchestrator);
    kernel
        .on("coord.arrive", move |m| {
            let who = m.sender.clone();
            if b.arrive("phase-1", &who).unwrap() {
                sig.raise("phase-1.done");
            }
        })
        .unwrap();

    let a = AgentMailbox::new(Arc::clone(&bus), "coder-1", AgentRole::Coder);
    let t = AgentMailbox::new(Arc::clone(&bus), "tester-1", AgentRole::Tester);
    a.send("coord.arrive", json!({})).unwrap();
    assert!(!signals.flag("phase-1.done").is_raised());
    t.send("coord.arrive", json!({})).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), barrier.wait("phase-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(signals.flag("phase-1.done").is_raised());
}
