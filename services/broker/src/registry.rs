//! The subscriber registry: who is connected, what they subscribed to,
//! and the channel that feeds each subscriber's send pipeline.
//!
//! The registry is the one structure shared across the command plane, the
//! fan-out drain, and subscriber registration.  It is mutex-guarded; no
//! lock is ever held across an `.await`.  Reaping of disconnected entries
//! happens only in `sweep`, the drain task's quiescent point, so a dispatch
//! never races a removal.

use crate::batch::MessageBatch;
use crate::context::ServerContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// One pattern a subscriber holds, with its idle-expiry bookkeeping.
#[derive(Debug)]
struct Subscription {
    pattern: String,
    /// Zero = never expires.
    timeout: Duration,
    last_activity: Instant,
}

impl Subscription {
    fn is_live(&self, now: Instant) -> bool {
        self.timeout.is_zero() || now.duration_since(self.last_activity) <= self.timeout
    }

    /// Prefix rule: the stored pattern may be more specific than the topic
    /// and still match — `news.sports` matches topic `news`, not the other
    /// way around.
    fn matches(&self, topic: &str, now: Instant) -> bool {
        self.is_live(now) && self.pattern.starts_with(topic)
    }
}

// ---------------------------------------------------------------------------
// Registry entries
// ---------------------------------------------------------------------------

struct SubscriberEntry {
    name: String,
    conn_id: u64,
    subscriptions: Vec<Subscription>,
    batches: mpsc::UnboundedSender<Arc<MessageBatch>>,
    disconnected: Arc<AtomicBool>,
}

impl SubscriberEntry {
    /// Add each pattern not already present.  Expired leftovers are dropped
    /// first — an expired pattern is semantically gone, so a re-subscribe
    /// after expiry starts a fresh entry.
    fn add_subscriptions(&mut self, timeout_ms: u64, patterns: &[String]) {
        let now = Instant::now();
        self.subscriptions.retain(|s| s.is_live(now));

        for pattern in patterns {
            if self.subscriptions.iter().any(|s| &s.pattern == pattern) {
                continue;
            }
            info!(name = %self.name, conn_id = self.conn_id, pattern = %pattern, timeout_ms, "adding subscription");
            self.subscriptions.push(Subscription {
                pattern: pattern.clone(),
                timeout: Duration::from_millis(timeout_ms),
                last_activity: now,
            });
        }
    }

    /// Deliver `batch` if any live pattern matches its topic, refreshing
    /// the activity clock of every pattern that did.
    fn push_if_subscribed(&mut self, batch: &Arc<MessageBatch>, now: Instant) -> bool {
        if self.disconnected.load(Ordering::Relaxed) {
            return false;
        }

        let mut matched = false;
        for sub in &mut self.subscriptions {
            if sub.matches(batch.topic(), now) {
                sub.last_activity = now;
                matched = true;
            }
        }
        if !matched {
            return false;
        }

        if self.batches.send(Arc::clone(batch)).is_err() {
            // Writer task is gone; the sweep will reap us.
            self.disconnected.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// What a subscriber connection gets back from registration.
pub struct Registration {
    /// Ordered feed of batches to write; the pending queue of the send
    /// pipeline.
    pub batches: mpsc::UnboundedReceiver<Arc<MessageBatch>>,
    /// Set by the connection's reader/writer on EOF or write failure;
    /// checked by every dispatch and by the sweep that reaps the entry.
    pub disconnected: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    inner: Mutex<Vec<SubscriberEntry>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        SubscriberRegistry::default()
    }

    /// Register a freshly handshaken subscriber and, atomically with the
    /// registration, drain its pending subscriptions from the context —
    /// a subscribe command observes either "not yet connected" (and latches
    /// pending) or the registered entry, never a gap.
    pub fn register(&self, name: &str, conn_id: u64, ctx: &ServerContext) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        let disconnected = Arc::new(AtomicBool::new(false));
        let mut entry = SubscriberEntry {
            name: name.to_owned(),
            conn_id,
            subscriptions: Vec::new(),
            batches: tx,
            disconnected: Arc::clone(&disconnected),
        };

        // Lock order: registry, then context.
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        for pending in ctx.take_pending(name) {
            entry.add_subscriptions(pending.timeout_ms, &pending.patterns);
        }
        inner.push(entry);

        Registration {
            batches: rx,
            disconnected,
        }
    }

    /// Apply a subscribe command to every connected subscriber named
    /// `name`.  Returns false if none was found.
    pub fn apply_subscriptions(&self, name: &str, timeout_ms: u64, patterns: &[String]) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        Self::apply_locked(&mut inner, name, timeout_ms, patterns)
    }

    /// Apply to every connected subscriber named `name`, or — under the
    /// same registry lock, so no registration can slip between the lookup
    /// and the latch — record a pending subscription for when it connects.
    /// Returns true if a connected subscriber took it directly.
    pub fn subscribe_or_latch(
        &self,
        ctx: &ServerContext,
        name: &str,
        timeout_ms: u64,
        patterns: &[String],
    ) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if Self::apply_locked(&mut inner, name, timeout_ms, patterns) {
            return true;
        }

        // Lock order: registry, then context — same as `register`.
        ctx.add_pending(crate::context::PendingSubscription {
            name: name.to_owned(),
            patterns: patterns.to_vec(),
            timeout_ms,
        });
        false
    }

    fn apply_locked(
        inner: &mut Vec<SubscriberEntry>,
        name: &str,
        timeout_ms: u64,
        patterns: &[String],
    ) -> bool {
        let mut found = false;
        for entry in inner
            .iter_mut()
            .filter(|e| e.name == name && !e.disconnected.load(Ordering::Relaxed))
        {
            entry.add_subscriptions(timeout_ms, patterns);
            found = true;
        }
        found
    }

    /// Fan one batch out to every matching subscriber.  Returns how many
    /// received it.
    pub fn dispatch(&self, batch: &Arc<MessageBatch>) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let mut delivered = 0;
        for entry in inner.iter_mut() {
            if entry.push_if_subscribed(batch, now) {
                delivered += 1;
            }
        }
        delivered
    }

    /// The periodic quiescent-point pass: purge expired subscriptions and
    /// reap disconnected subscribers.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        for entry in inner.iter_mut() {
            entry.subscriptions.retain(|sub| {
                let live = sub.is_live(now);
                if !live {
                    info!(name = %entry.name, pattern = %sub.pattern, "subscription expired");
                }
                live
            });
        }

        inner.retain(|entry| {
            let keep = !entry.disconnected.load(Ordering::Relaxed);
            if !keep {
                debug!(name = %entry.name, conn_id = entry.conn_id, "reaped disconnected subscriber");
            }
            keep
        });
    }

    /// Number of registered (not yet reaped) subscribers.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(topic: &str, payload: &[u8]) -> Arc<MessageBatch> {
        let mut batcher = crate::batch::Batcher::new(usize::MAX);
        batcher.push(&rr_protocol::Frame::new(topic, payload.to_vec()));
        Arc::new(batcher.flush().unwrap())
    }

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn pattern_prefix_rule_is_pattern_starts_with_topic() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let mut reg = registry.register("alice", 1, &ctx);
        registry.apply_subscriptions("alice", 0, &patterns(&["news.sports"]));

        // Pattern more specific than the topic: matches.
        assert_eq!(registry.dispatch(&batch("news", b"x")), 1);
        assert!(reg.batches.try_recv().is_ok());

        // Topic more specific than the pattern: does not match.
        assert_eq!(registry.dispatch(&batch("news.sports.hockey", b"x")), 0);
        assert!(reg.batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn unrelated_topic_is_isolated() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let mut reg = registry.register("alice", 1, &ctx);
        registry.apply_subscriptions("alice", 0, &patterns(&["prices"]));

        assert_eq!(registry.dispatch(&batch("news", b"x")), 0);
        assert!(reg.batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_patterns_are_suppressed() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let mut reg = registry.register("alice", 1, &ctx);
        registry.apply_subscriptions("alice", 0, &patterns(&["t"]));
        registry.apply_subscriptions("alice", 0, &patterns(&["t", "t"]));

        assert_eq!(registry.dispatch(&batch("t", b"x")), 1);
        // One delivery, not one per duplicate add.
        assert!(reg.batches.try_recv().is_ok());
        assert!(reg.batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn registration_drains_pending_subscriptions() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        ctx.add_pending(crate::context::PendingSubscription {
            name: "bob".to_owned(),
            patterns: patterns(&["x"]),
            timeout_ms: 0,
        });

        let mut reg = registry.register("bob", 1, &ctx);
        assert_eq!(ctx.pending_len(), 0);
        assert_eq!(registry.dispatch(&batch("x", b"abc")), 1);
        assert!(reg.batches.try_recv().is_ok());
    }

    #[tokio::test]
    async fn expired_subscription_stops_matching_and_is_swept() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let mut reg = registry.register("alice", 1, &ctx);
        registry.apply_subscriptions("alice", 30, &patterns(&["news"]));

        // Fresh: matches.
        assert_eq!(registry.dispatch(&batch("news", b"1")), 1);
        let _ = reg.batches.try_recv();

        std::thread::sleep(Duration::from_millis(80));

        // Past the idle timeout: matching returns false even before a sweep.
        assert_eq!(registry.dispatch(&batch("news", b"2")), 0);
        registry.sweep();

        // Re-subscribing after expiry starts a fresh entry.
        registry.apply_subscriptions("alice", 30, &patterns(&["news"]));
        assert_eq!(registry.dispatch(&batch("news", b"3")), 1);
    }

    #[tokio::test]
    async fn delivery_refreshes_the_activity_clock() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let mut reg = registry.register("alice", 1, &ctx);
        registry.apply_subscriptions("alice", 60, &patterns(&["t"]));

        // Keep traffic flowing at half the timeout; the subscription must
        // survive well past its idle limit.
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(25));
            assert_eq!(registry.dispatch(&batch("t", b"x")), 1);
            let _ = reg.batches.try_recv();
        }
    }

    #[tokio::test]
    async fn disconnected_subscriber_matches_nothing_and_is_reaped() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let reg = registry.register("alice", 1, &ctx);
        registry.apply_subscriptions("alice", 0, &patterns(&["t"]));

        reg.disconnected.store(true, Ordering::Relaxed);
        assert_eq!(registry.dispatch(&batch("t", b"x")), 0);

        registry.sweep();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropped_receiver_marks_the_entry_disconnected() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let reg = registry.register("alice", 1, &ctx);
        registry.apply_subscriptions("alice", 0, &patterns(&["t"]));

        drop(reg.batches);
        assert_eq!(registry.dispatch(&batch("t", b"x")), 0);
        assert!(reg.disconnected.load(Ordering::Relaxed));

        registry.sweep();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn command_applies_to_every_connection_with_the_name() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();
        let mut first = registry.register("alice", 1, &ctx);
        let mut second = registry.register("alice", 2, &ctx);

        assert!(registry.apply_subscriptions("alice", 0, &patterns(&["t"])));
        assert_eq!(registry.dispatch(&batch("t", b"x")), 2);
        assert!(first.batches.try_recv().is_ok());
        assert!(second.batches.try_recv().is_ok());
    }

    #[tokio::test]
    async fn apply_reports_unknown_names() {
        let registry = SubscriberRegistry::new();
        assert!(!registry.apply_subscriptions("ghost", 0, &patterns(&["t"])));
    }

    #[tokio::test]
    async fn subscribe_or_latch_covers_the_not_yet_connected_case() {
        let registry = SubscriberRegistry::new();
        let ctx = ServerContext::new();

        assert!(!registry.subscribe_or_latch(&ctx, "bob", 0, &patterns(&["x"])));
        assert_eq!(ctx.pending_len(), 1);

        // Registration drains the latched subscription...
        let mut reg = registry.register("bob", 1, &ctx);
        assert_eq!(ctx.pending_len(), 0);
        assert_eq!(registry.dispatch(&batch("x", b"1")), 1);
        assert!(reg.batches.try_recv().is_ok());

        // ...and once connected, commands apply directly.
        assert!(registry.subscribe_or_latch(&ctx, "bob", 0, &patterns(&["y"])));
        assert_eq!(ctx.pending_len(), 0);
    }
}
