//! Actor bookkeeping and mailbox monitoring.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Connection | < 16   | 16-64   | > 64     |
//!
//! Depth changes are mirrored to the `relay_actor_mailbox_depth` gauge.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const REGISTRY_MAILBOX_NORMAL: usize = 100;
pub const REGISTRY_MAILBOX_WARNING: usize = 500;

pub const CONNECTION_MAILBOX_NORMAL: usize = 16;
pub const CONNECTION_MAILBOX_WARNING: usize = 64;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// SessionRegistryActor (singleton).
    Registry,
    /// SessionActor (one per streaming session).
    Session,
    /// ConnectionActor (one per signaling connection).
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Session => "session",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_WARNING,
            ActorType::Session | ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_NORMAL,
            ActorType::Session | ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth for one actor mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);

        let level = self.level_for_depth(new_depth);
        if level == MailboxLevel::Critical {
            warn!(
                target: "relay.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            );
        } else if level == MailboxLevel::Warning
            && new_depth == self.actor_type.normal_threshold() + 1
        {
            debug!(
                target: "relay.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            );
        }
    }

    /// Record a message being taken off the mailbox.
    pub fn record_dequeue(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            })
            .unwrap_or(0);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), previous.saturating_sub(1));
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Counters shared across the actor system.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Signaling connections currently open.
    pub active_connections: AtomicUsize,
    /// Actor panics observed (indicates bugs).
    pub actor_panics: AtomicU64,
    /// Messages processed across all actors.
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_created(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_signaling_connections_active(count);
    }

    pub fn connection_closed(&self) {
        let previous = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0);
        metrics::set_signaling_connections_active(previous.saturating_sub(1));
    }

    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_error("actor_panic");
        tracing::error!(
            target: "relay.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}
