//! Typed message routing between agents.
//!
//! Each registered agent owns a bounded [`Mailbox`]. Delivery into a full
//! mailbox is retried with capped exponential backoff until either the
//! retry budget or the message TTL runs out; a message is never enqueued
//! after its TTL, and mailboxes drop anything that expired while queued.
//! Undeliverable messages produce a `delivery_failure` notice to the sender.

use crate::config::BusConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{AgentId, MaestroError, MaestroResult, Priority, Specialty};
use maestro_security::{AuditLog, AuditOutcome};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Topic the executive layer listens on for escalations.
pub const EXECUTIVE_TOPIC: &str = "executive";

/// Sender id for messages originating outside any agent.
pub const SYSTEM_SENDER: AgentId = AgentId(0);

/// Settled help requests kept for status lookups before the oldest are dropped.
pub const HELP_RETENTION: usize = 256;

/// Addressee of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum Recipient {
    /// One agent.
    Agent(AgentId),
    /// Several agents, delivered to each.
    Agents(Vec<AgentId>),
    /// Every subscriber of a topic.
    Topic(String),
}

/// Message payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    /// Point-to-point payload.
    Direct {
        /// Opaque payload.
        payload: serde_json::Value,
    },
    /// Fan-out to a topic.
    Broadcast {
        /// Topic the message was published on.
        topic: String,
        /// Opaque payload.
        payload: serde_json::Value,
    },
    /// A request for help from another specialty.
    HelpRequest {
        /// Id answered by the matching `HelpResponse`.
        request_id: Uuid,
        /// Specialty asked for.
        specialty: Specialty,
        /// What the requester is working on.
        context: serde_json::Value,
    },
    /// Answer to a `HelpRequest`.
    HelpResponse {
        /// Id of the request being answered.
        request_id: Uuid,
        /// Opaque payload.
        payload: serde_json::Value,
    },
    /// Shared working context.
    ContextShare {
        /// Opaque payload.
        data: serde_json::Value,
    },
    /// Issue raised to the executive layer.
    Escalation {
        /// Unique escalation id.
        escalation_id: Uuid,
        /// Taxonomy class of the issue.
        issue_type: String,
        /// Execution and sub-task details.
        data: serde_json::Value,
    },
    /// Dead-letter notice sent back to the sender.
    DeliveryFailure {
        /// Message that could not be delivered.
        message_id: Uuid,
        /// Last delivery error.
        reason: String,
    },
}

impl MessageKind {
    /// Short name used in logs and audit entries.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Direct { .. } => "direct",
            MessageKind::Broadcast { .. } => "broadcast",
            MessageKind::HelpRequest { .. } => "help_request",
            MessageKind::HelpResponse { .. } => "help_response",
            MessageKind::ContextShare { .. } => "context_share",
            MessageKind::Escalation { .. } => "escalation",
            MessageKind::DeliveryFailure { .. } => "delivery_failure",
        }
    }
}

/// Where a message is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued, not yet delivered.
    Pending,
    /// Accepted by every recipient.
    Delivered,
    /// Retries exhausted.
    Failed,
    /// TTL passed before delivery.
    Expired,
}

/// A routed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique message id.
    pub id: Uuid,
    /// Agent that sent the message, or [`SYSTEM_SENDER`].
    pub sender: AgentId,
    /// Who the message is for.
    pub recipient: Recipient,
    /// Typed payload.
    pub kind: MessageKind,
    /// Mailboxes hand higher priorities out first.
    pub priority: Priority,
    /// Lifetime from creation; never enqueued or received after it.
    pub ttl_ms: u64,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    created: Instant,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// Where delivery stands.
    pub status: DeliveryStatus,
}

impl BusMessage {
    fn new(sender: AgentId, recipient: Recipient, kind: MessageKind, priority: Priority, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            recipient,
            kind,
            priority,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            created_at: Utc::now(),
            created: Instant::now(),
            attempts: 0,
            status: DeliveryStatus::Pending,
        }
    }

    /// Lifetime as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Whether the TTL has run out.
    pub fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl()
    }

    fn remaining(&self) -> Duration {
        self.ttl().saturating_sub(self.created.elapsed())
    }
}

/// Receiving end of an agent's bus registration.
pub struct Mailbox {
    owner: AgentId,
    rx: mpsc::Receiver<BusMessage>,
    inner: Arc<BusInner>,
}

impl Mailbox {
    /// Agent this mailbox belongs to.
    pub fn owner(&self) -> AgentId {
        self.owner
    }

    /// Next live message. Expired messages are dropped and reported to
    /// their sender. Returns `None` once the agent is unregistered.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            let msg = self.rx.recv().await?;
            if let Some(msg) = self.accept(msg) {
                return Some(msg);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        while let Ok(msg) = self.rx.try_recv() {
            if let Some(msg) = self.accept(msg) {
                return Some(msg);
            }
        }
        None
    }

    fn accept(&self, msg: BusMessage) -> Option<BusMessage> {
        if msg.is_expired() {
            self.inner.stats.expired.fetch_add(1, Ordering::Relaxed);
            debug!(message_id = %msg.id, agent_id = %self.owner, "Dropped expired message");
            self.inner
                .notify_failure(msg.sender, msg.id, &msg.kind, "ttl expired in mailbox");
            return None;
        }
        self.inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Some(msg)
    }
}

/// Locates (or creates) an agent able to help with a specialty.
#[async_trait]
pub trait HelpRouter: Send + Sync {
    /// Pick an agent with `specialty`, spawning one if the pool allows.
    async fn locate_helper(&self, specialty: &Specialty, requester: AgentId) -> MaestroResult<AgentId>;
}

/// Lifecycle of a help request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelpStatus {
    /// Waiting for an answer.
    Pending,
    /// Answered by the helper.
    Answered,
    /// Helper unavailable or request expired.
    Failed,
}

#[derive(Debug, Clone)]
struct HelpRecord {
    requester: AgentId,
    helper: AgentId,
    status: HelpStatus,
    response: Option<serde_json::Value>,
    requested_at: Instant,
}

/// Help records by request id. Pending records live until they settle or
/// outlive the message TTL; settled ones are kept up to [`HELP_RETENTION`].
#[derive(Default)]
struct HelpBook {
    records: HashMap<Uuid, HelpRecord>,
    settled: VecDeque<Uuid>,
}

impl HelpBook {
    fn settle(&mut self, request_id: Uuid, status: HelpStatus) {
        let Some(record) = self.records.get_mut(&request_id) else {
            return;
        };
        let was_pending = record.status == HelpStatus::Pending;
        record.status = status;
        if was_pending {
            self.settled.push_back(request_id);
        }
        while self.settled.len() > HELP_RETENTION {
            if let Some(oldest) = self.settled.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }

    /// Fail pending requests older than `ttl`. Returns how many expired.
    fn sweep(&mut self, ttl: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|(_, r)| r.status == HelpStatus::Pending && r.requested_at.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for request_id in &stale {
            self.settle(*request_id, HelpStatus::Failed);
        }
        stale.len()
    }
}

#[derive(Debug, Default)]
struct BusStats {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time delivery counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStatsSnapshot {
    /// Messages accepted for delivery.
    pub sent: u64,
    /// Messages handed to their recipient.
    pub delivered: u64,
    /// Messages that exhausted their retries or had no recipient.
    pub failed: u64,
    /// Messages whose TTL ran out before delivery.
    pub expired: u64,
    /// Delivery retries into full mailboxes.
    pub retried: u64,
    /// Delivered share of settled messages; 1.0 before anything settled.
    pub success_rate: f64,
}

struct BusInner {
    config: BusConfig,
    mailboxes: RwLock<HashMap<AgentId, mpsc::Sender<BusMessage>>>,
    topics: RwLock<HashMap<String, BTreeSet<AgentId>>>,
    help: RwLock<HelpBook>,
    router: RwLock<Option<Arc<dyn HelpRouter>>>,
    audit: AuditLog,
    stats: BusStats,
}

impl BusInner {
    fn mailbox(&self, agent: AgentId) -> Option<mpsc::Sender<BusMessage>> {
        self.mailboxes.read().get(&agent).cloned()
    }

    /// Tell `sender` that a message could not be delivered. Failure notices
    /// themselves are never reported, and the notice is best effort.
    fn notify_failure(&self, sender: AgentId, message_id: Uuid, kind: &MessageKind, reason: &str) {
        if matches!(kind, MessageKind::DeliveryFailure { .. }) {
            return;
        }
        if let Some(tx) = self.mailbox(sender) {
            let notice = BusMessage::new(
                SYSTEM_SENDER,
                Recipient::Agent(sender),
                MessageKind::DeliveryFailure {
                    message_id,
                    reason: reason.to_string(),
                },
                Priority::High,
                self.config.default_ttl(),
            );
            let _ = tx.try_send(notice);
        }
    }
}

/// Handle to the message bus. Cloning is cheap.
#[derive(Clone)]
pub struct CommunicationBus {
    inner: Arc<BusInner>,
}

enum Undelivered {
    Expired,
    Failed(String),
}

impl CommunicationBus {
    /// A bus with no mailboxes. Every send, failure and escalation is audited to `audit`.
    pub fn new(config: BusConfig, audit: AuditLog) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                mailboxes: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
                help: RwLock::new(HelpBook::default()),
                router: RwLock::new(None),
                audit,
                stats: BusStats::default(),
            }),
        }
    }

    /// Delivery settings.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Create (or replace) the mailbox of an agent.
    pub fn register(&self, agent: AgentId) -> Mailbox {
        let (tx, rx) = mpsc::channel(self.inner.config.mailbox_capacity);
        self.inner.mailboxes.write().insert(agent, tx);
        debug!(agent_id = %agent, "Mailbox registered");
        Mailbox {
            owner: agent,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Drop an agent's mailbox and subscriptions. Help requests it was
    /// answering are marked failed.
    pub fn unregister(&self, agent: AgentId) {
        self.inner.mailboxes.write().remove(&agent);
        for subscribers in self.inner.topics.write().values_mut() {
            subscribers.remove(&agent);
        }
        {
            let mut help = self.inner.help.write();
            let orphaned: Vec<Uuid> = help
                .records
                .iter()
                .filter(|(_, r)| r.helper == agent && r.status == HelpStatus::Pending)
                .map(|(id, _)| *id)
                .collect();
            for request_id in orphaned {
                help.settle(request_id, HelpStatus::Failed);
            }
        }
        debug!(agent_id = %agent, "Mailbox unregistered");
    }

    /// Whether `agent` currently has a mailbox.
    pub fn is_registered(&self, agent: AgentId) -> bool {
        self.inner.mailboxes.read().contains_key(&agent)
    }

    /// Add `agent` to a topic's subscribers.
    pub fn subscribe(&self, agent: AgentId, topic: &str) {
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(agent);
    }

    /// Remove `agent` from a topic's subscribers.
    pub fn unsubscribe(&self, agent: AgentId, topic: &str) {
        if let Some(subscribers) = self.inner.topics.write().get_mut(topic) {
            subscribers.remove(&agent);
        }
    }

    /// Current subscribers of a topic, ascending by id.
    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Route help requests through `router`.
    pub fn set_help_router(&self, router: Arc<dyn HelpRouter>) {
        *self.inner.router.write() = Some(router);
    }

    /// Drop the help router; later help requests fail.
    pub fn clear_help_router(&self) {
        self.inner.router.write().take();
    }

    /// Send with the default TTL.
    pub async fn send(
        &self,
        sender: AgentId,
        recipient: Recipient,
        kind: MessageKind,
        priority: Priority,
    ) -> MaestroResult<Uuid> {
        let ttl = self.inner.config.default_ttl();
        self.send_with_ttl(sender, recipient, kind, priority, ttl).await
    }

    /// Deliver a message to every resolved recipient, retrying full
    /// mailboxes with backoff. Fails if any recipient could not be reached;
    /// the sender then also receives a `delivery_failure` notice.
    pub async fn send_with_ttl(
        &self,
        sender: AgentId,
        recipient: Recipient,
        kind: MessageKind,
        priority: Priority,
        ttl: Duration,
    ) -> MaestroResult<Uuid> {
        let targets = self.resolve(sender, &recipient);
        let msg = BusMessage::new(sender, recipient, kind, priority, ttl);
        let id = msg.id;
        self.inner.stats.sent.fetch_add(1, Ordering::Relaxed);

        if targets.is_empty() {
            self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            self.inner.notify_failure(sender, id, &msg.kind, "no recipients");
            return Err(MaestroError::Delivery(format!("message {id} has no recipients")));
        }

        let mut failures = Vec::new();
        for target in targets {
            if let Err(reason) = self.deliver(target, msg.clone()).await {
                failures.push(format!("{target}: {reason}"));
            }
        }
        if failures.is_empty() {
            Ok(id)
        } else {
            Err(MaestroError::Delivery(format!(
                "message {id} undelivered ({})",
                failures.join(", ")
            )))
        }
    }

    fn resolve(&self, sender: AgentId, recipient: &Recipient) -> Vec<AgentId> {
        match recipient {
            Recipient::Agent(id) => vec![*id],
            Recipient::Agents(ids) => {
                let mut ids = ids.clone();
                ids.sort();
                ids.dedup();
                ids
            }
            Recipient::Topic(topic) => self
                .subscribers(topic)
                .into_iter()
                .filter(|id| *id != sender)
                .collect(),
        }
    }

    async fn deliver(&self, target: AgentId, msg: BusMessage) -> Result<(), String> {
        let (sender, id) = (msg.sender, msg.id);
        let kind = msg.kind.clone();
        match self.try_deliver(target, msg).await {
            Ok(()) => Ok(()),
            Err(Undelivered::Expired) => {
                self.inner.stats.expired.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %id, agent_id = %target, "Message expired before delivery");
                self.inner.notify_failure(sender, id, &kind, "ttl expired");
                Err("ttl expired".to_string())
            }
            Err(Undelivered::Failed(reason)) => {
                self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %id, agent_id = %target, reason = %reason, "Message delivery failed");
                self.inner.notify_failure(sender, id, &kind, &reason);
                Err(reason)
            }
        }
    }

    async fn try_deliver(&self, target: AgentId, mut msg: BusMessage) -> Result<(), Undelivered> {
        let config = &self.inner.config;
        let Some(tx) = self.inner.mailbox(target) else {
            return Err(Undelivered::Failed("no mailbox".into()));
        };

        for attempt in 0..=config.max_retries {
            if msg.is_expired() {
                return Err(Undelivered::Expired);
            }
            msg.attempts = attempt + 1;
            let wait = msg.remaining().min(config.delivery_timeout());
            match tokio::time::timeout(wait, tx.reserve()).await {
                Ok(Ok(permit)) => {
                    // the reservation may have taken the rest of the TTL
                    if msg.is_expired() {
                        return Err(Undelivered::Expired);
                    }
                    msg.status = DeliveryStatus::Delivered;
                    permit.send(msg);
                    return Ok(());
                }
                Ok(Err(_)) => return Err(Undelivered::Failed("mailbox closed".into())),
                Err(_) => {}
            }
            if attempt < config.max_retries {
                self.inner.stats.retried.fetch_add(1, Ordering::Relaxed);
                let delay = config.backoff_delay(attempt).min(msg.remaining());
                tokio::time::sleep(delay).await;
            }
        }
        Err(Undelivered::Failed(format!(
            "mailbox full after {} attempts",
            msg.attempts
        )))
    }

    /// Fan a payload out to every subscriber of `topic` except the sender.
    /// Deliveries run concurrently; returns the ids of delivered copies.
    pub async fn broadcast(
        &self,
        sender: AgentId,
        topic: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Vec<Uuid> {
        let mut set = JoinSet::new();
        for target in self.resolve(sender, &Recipient::Topic(topic.to_string())) {
            let bus = self.clone();
            let kind = MessageKind::Broadcast {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            set.spawn(async move {
                bus.send(sender, Recipient::Agent(target), kind, priority).await
            });
        }
        let mut delivered = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Ok(id)) = joined {
                delivered.push(id);
            }
        }
        delivered
    }

    /// Ask the hierarchy for a helper and send it a help request.
    /// Returns the correlation id the helper's response will carry.
    pub async fn request_help(
        &self,
        requester: AgentId,
        specialty: Specialty,
        context: serde_json::Value,
    ) -> MaestroResult<Uuid> {
        let router = self
            .inner
            .router
            .read()
            .clone()
            .ok_or_else(|| MaestroError::Delivery("no help router registered".into()))?;
        let helper = router.locate_helper(&specialty, requester).await?;

        let request_id = Uuid::new_v4();
        {
            let mut help = self.inner.help.write();
            let expired = help.sweep(self.inner.config.default_ttl());
            if expired > 0 {
                debug!(expired, "Unanswered help requests expired");
            }
            help.records.insert(
                request_id,
                HelpRecord {
                    requester,
                    helper,
                    status: HelpStatus::Pending,
                    response: None,
                    requested_at: Instant::now(),
                },
            );
        }
        let kind = MessageKind::HelpRequest {
            request_id,
            specialty: specialty.clone(),
            context,
        };
        if let Err(e) = self
            .send(requester, Recipient::Agent(helper), kind, Priority::High)
            .await
        {
            self.set_help_status(request_id, HelpStatus::Failed);
            return Err(e);
        }
        info!(
            request_id = %request_id,
            requester = %requester,
            helper = %helper,
            specialty = %specialty,
            "Help requested"
        );
        Ok(request_id)
    }

    /// Answer a help request; the response goes back to the requester.
    pub async fn respond_help(
        &self,
        helper: AgentId,
        request_id: Uuid,
        payload: serde_json::Value,
    ) -> MaestroResult<Uuid> {
        let requester = {
            let mut help = self.inner.help.write();
            let record = help
                .records
                .get_mut(&request_id)
                .ok_or_else(|| MaestroError::NotFound(format!("help request {request_id}")))?;
            record.response = Some(payload.clone());
            record.requester
        };
        let kind = MessageKind::HelpResponse { request_id, payload };
        match self
            .send(helper, Recipient::Agent(requester), kind, Priority::High)
            .await
        {
            Ok(id) => {
                self.set_help_status(request_id, HelpStatus::Answered);
                Ok(id)
            }
            Err(e) => {
                self.set_help_status(request_id, HelpStatus::Failed);
                Err(e)
            }
        }
    }

    /// Mark a help request failed, e.g. when the helper could not run it.
    pub fn fail_help(&self, request_id: Uuid) {
        self.set_help_status(request_id, HelpStatus::Failed);
    }

    fn set_help_status(&self, request_id: Uuid, status: HelpStatus) {
        self.inner.help.write().settle(request_id, status);
    }

    /// Fail help requests nobody answered within the message TTL.
    pub fn sweep_help(&self) -> usize {
        self.inner.help.write().sweep(self.inner.config.default_ttl())
    }

    /// Status of a help request, or `None` once it has aged out.
    pub fn help_status(&self, request_id: Uuid) -> Option<HelpStatus> {
        self.inner.help.read().records.get(&request_id).map(|r| r.status)
    }

    /// The helper's answer, if one was given and is still retained.
    pub fn help_response(&self, request_id: Uuid) -> Option<serde_json::Value> {
        self.inner
            .help
            .read()
            .records
            .get(&request_id)
            .and_then(|r| r.response.clone())
    }

    /// Route an issue to the executive layer. The escalation is written to
    /// the audit trail whether or not delivery succeeds.
    pub async fn escalate(
        &self,
        agent: AgentId,
        issue_type: &str,
        data: serde_json::Value,
    ) -> MaestroResult<Uuid> {
        let escalation_id = Uuid::new_v4();
        let kind = MessageKind::Escalation {
            escalation_id,
            issue_type: issue_type.to_string(),
            data: data.clone(),
        };
        let result = self
            .send(
                agent,
                Recipient::Topic(EXECUTIVE_TOPIC.to_string()),
                kind,
                Priority::Critical,
            )
            .await;

        let execution_id = data
            .get("execution_id")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let outcome = if result.is_ok() {
            AuditOutcome::Escalated
        } else {
            AuditOutcome::Failure
        };
        self.inner.audit.log_action(
            execution_id,
            Some(agent),
            "escalation",
            serde_json::json!({
                "escalation_id": escalation_id,
                "issue_type": issue_type,
                "data": data,
                "delivered": result.is_ok(),
            }),
            outcome,
        );
        warn!(
            escalation_id = %escalation_id,
            agent_id = %agent,
            issue_type,
            delivered = result.is_ok(),
            "Escalation raised"
        );
        result.map(|_| escalation_id)
    }

    /// Best-effort context push: one attempt per recipient, never blocks.
    /// Returns how many recipients accepted the message.
    pub fn share_context(&self, sender: AgentId, recipients: &[AgentId], data: serde_json::Value) -> usize {
        let mut accepted = 0;
        for target in recipients.iter().filter(|id| **id != sender) {
            let msg = BusMessage::new(
                sender,
                Recipient::Agent(*target),
                MessageKind::ContextShare { data: data.clone() },
                Priority::Low,
                self.inner.config.default_ttl(),
            );
            self.inner.stats.sent.fetch_add(1, Ordering::Relaxed);
            let sent = self
                .inner
                .mailbox(*target)
                .is_some_and(|tx| tx.try_send(msg).is_ok());
            if sent {
                accepted += 1;
            } else {
                self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        accepted
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> BusStatsSnapshot {
        let s = &self.inner.stats;
        let delivered = s.delivered.load(Ordering::Relaxed);
        let failed = s.failed.load(Ordering::Relaxed);
        let expired = s.expired.load(Ordering::Relaxed);
        let settled = delivered + failed + expired;
        BusStatsSnapshot {
            sent: s.sent.load(Ordering::Relaxed),
            delivered,
            failed,
            expired,
            retried: s.retried.load(Ordering::Relaxed),
            success_rate: if settled == 0 {
                1.0
            } else {
                delivered as f64 / settled as f64
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bus_with(config: BusConfig) -> (CommunicationBus, AuditLog) {
        let audit = AuditLog::in_memory();
        (CommunicationBus::new(config, audit.clone()), audit)
    }

    fn bus() -> CommunicationBus {
        bus_with(BusConfig::default()).0
    }

    fn direct(n: i64) -> MessageKind {
        MessageKind::Direct {
            payload: serde_json::json!(n),
        }
    }

    #[tokio::test]
    async fn test_direct_delivery() {
        let bus = bus();
        let _a = bus.register(AgentId(1));
        let mut b = bus.register(AgentId(2));

        let id = bus
            .send(AgentId(1), Recipient::Agent(AgentId(2)), direct(7), Priority::Normal)
            .await
            .unwrap();
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.status, DeliveryStatus::Delivered);
        assert_eq!(msg.attempts, 1);
        assert_eq!(bus.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient_fails_and_notifies_sender() {
        let bus = bus();
        let mut a = bus.register(AgentId(1));
        let err = bus
            .send(AgentId(1), Recipient::Agent(AgentId(9)), direct(1), Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Delivery(_)));

        let notice = a.try_recv().unwrap();
        assert!(matches!(notice.kind, MessageKind::DeliveryFailure { .. }));
        assert_eq!(bus.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let bus = bus();
        let mut a = bus.register(AgentId(1));
        let mut b = bus.register(AgentId(2));
        let mut c = bus.register(AgentId(3));
        for id in [1, 2, 3] {
            bus.subscribe(AgentId(id), "news");
        }

        let ids = bus
            .broadcast(AgentId(1), "news", serde_json::json!("hi"), Priority::Normal)
            .await;
        assert_eq!(ids.len(), 2);
        assert!(b.try_recv().is_some());
        assert!(c.try_recv().is_some());
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_mailbox_expires_within_ttl() {
        let (bus, _) = bus_with(BusConfig {
            mailbox_capacity: 1,
            max_retries: 10,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
            delivery_timeout_ms: 20,
            ..Default::default()
        });
        let mut sender = bus.register(AgentId(1));
        let mut receiver = bus.register(AgentId(2));

        bus.send(AgentId(1), Recipient::Agent(AgentId(2)), direct(1), Priority::Normal)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = bus
            .send_with_ttl(
                AgentId(1),
                Recipient::Agent(AgentId(2)),
                direct(2),
                Priority::Normal,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ttl expired"), "{err}");
        assert!(started.elapsed() < Duration::from_millis(400));

        let notice = sender.try_recv().unwrap();
        assert!(matches!(notice.kind, MessageKind::DeliveryFailure { .. }));

        // only the first message ever reaches the receiver
        let first = receiver.recv().await.unwrap();
        assert!(matches!(first.kind, MessageKind::Direct { ref payload } if payload == &serde_json::json!(1)));
        assert!(receiver.try_recv().is_none());

        let stats = bus.stats();
        assert_eq!(stats.expired, 1);
        assert!(stats.retried >= 1);
    }

    #[tokio::test]
    async fn test_mailbox_drops_messages_that_expired_while_queued() {
        let bus = bus();
        let mut sender = bus.register(AgentId(1));
        let mut receiver = bus.register(AgentId(2));

        bus.send_with_ttl(
            AgentId(1),
            Recipient::Agent(AgentId(2)),
            direct(1),
            Priority::Normal,
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let got = tokio::time::timeout(Duration::from_millis(50), receiver.recv()).await;
        assert!(got.is_err(), "expired message must not be delivered");
        let notice = sender.try_recv().unwrap();
        assert!(matches!(notice.kind, MessageKind::DeliveryFailure { .. }));
        assert_eq!(bus.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_escalation_is_audited_even_without_executive() {
        let (bus, audit) = bus_with(BusConfig::default());
        let _a = bus.register(AgentId(5));
        let result = bus
            .escalate(AgentId(5), "quality_gate_failure", serde_json::json!({"score": 0.7}))
            .await;
        assert!(result.is_err());
        assert_eq!(audit.len(), 1);
        assert_eq!(audit.entries()[0].outcome, AuditOutcome::Failure);

        let mut exec = bus.register(AgentId(1));
        bus.subscribe(AgentId(1), EXECUTIVE_TOPIC);
        let escalation_id = bus
            .escalate(AgentId(5), "stalled", serde_json::Value::Null)
            .await
            .unwrap();
        let msg = exec.recv().await.unwrap();
        assert!(matches!(msg.kind, MessageKind::Escalation { escalation_id: e, .. } if e == escalation_id));
        assert_eq!(msg.priority, Priority::Critical);
        assert_eq!(audit.len(), 2);
    }

    struct FixedRouter(AgentId);

    #[async_trait]
    impl HelpRouter for FixedRouter {
        async fn locate_helper(&self, _specialty: &Specialty, _requester: AgentId) -> MaestroResult<AgentId> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_help_request_round_trip() {
        let bus = bus();
        let mut requester = bus.register(AgentId(1));
        let mut helper = bus.register(AgentId(2));

        assert!(bus
            .request_help(AgentId(1), Specialty::Data, serde_json::Value::Null)
            .await
            .is_err());

        bus.set_help_router(Arc::new(FixedRouter(AgentId(2))));
        let request_id = bus
            .request_help(AgentId(1), Specialty::Data, serde_json::json!({"q": "rows"}))
            .await
            .unwrap();
        assert_eq!(bus.help_status(request_id), Some(HelpStatus::Pending));

        let msg = helper.recv().await.unwrap();
        let MessageKind::HelpRequest { request_id: rid, .. } = msg.kind else {
            panic!("expected help request");
        };
        assert_eq!(rid, request_id);

        bus.respond_help(AgentId(2), rid, serde_json::json!(42)).await.unwrap();
        let reply = requester.recv().await.unwrap();
        assert!(matches!(reply.kind, MessageKind::HelpResponse { request_id: r, .. } if r == request_id));
        assert_eq!(bus.help_status(request_id), Some(HelpStatus::Answered));
        assert_eq!(bus.help_response(request_id), Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_unregister_fails_pending_help() {
        let bus = bus();
        let _r = bus.register(AgentId(1));
        let _h = bus.register(AgentId(2));
        bus.set_help_router(Arc::new(FixedRouter(AgentId(2))));
        let request_id = bus
            .request_help(AgentId(1), Specialty::Review, serde_json::Value::Null)
            .await
            .unwrap();
        bus.unregister(AgentId(2));
        assert_eq!(bus.help_status(request_id), Some(HelpStatus::Failed));
        assert!(!bus.is_registered(AgentId(2)));
    }

    #[tokio::test]
    async fn test_settled_help_records_are_bounded() {
        let bus = bus();
        let _r = bus.register(AgentId(1));
        let mut helper = bus.register(AgentId(2));
        bus.set_help_router(Arc::new(FixedRouter(AgentId(2))));

        let mut first = None;
        for n in 0..HELP_RETENTION + 20 {
            let request_id = bus
                .request_help(AgentId(1), Specialty::Data, serde_json::json!(n))
                .await
                .unwrap();
            first.get_or_insert(request_id);
            helper.recv().await.unwrap();
            if n % 2 == 0 {
                bus.fail_help(request_id);
            } else {
                bus.respond_help(AgentId(2), request_id, serde_json::json!(n))
                    .await
                    .unwrap();
            }
        }
        let help = bus.inner.help.read();
        assert_eq!(help.records.len(), HELP_RETENTION);
        assert_eq!(help.settled.len(), HELP_RETENTION);
        drop(help);
        assert_eq!(bus.help_status(first.unwrap()), None);
    }

    #[tokio::test]
    async fn test_unanswered_help_expires_after_ttl() {
        let (bus, _) = bus_with(BusConfig {
            default_ttl_ms: 30,
            ..Default::default()
        });
        let _r = bus.register(AgentId(1));
        let _h = bus.register(AgentId(2));
        bus.set_help_router(Arc::new(FixedRouter(AgentId(2))));
        let stale = bus
            .request_help(AgentId(1), Specialty::Data, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(bus.sweep_help(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = bus
            .request_help(AgentId(1), Specialty::Data, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(bus.help_status(stale), Some(HelpStatus::Failed));
        assert_eq!(bus.help_status(fresh), Some(HelpStatus::Pending));
        assert_eq!(bus.inner.help.read().settled.len(), 1);
    }

    #[tokio::test]
    async fn test_share_context_is_best_effort() {
        let (bus, _) = bus_with(BusConfig {
            mailbox_capacity: 1,
            ..Default::default()
        });
        let _a = bus.register(AgentId(1));
        let mut b = bus.register(AgentId(2));
        let _c = bus.register(AgentId(3));

        let data = serde_json::json!({"k": "v"});
        assert_eq!(bus.share_context(AgentId(1), &[AgentId(2), AgentId(3), AgentId(4)], data.clone()), 2);
        // b's mailbox is full now
        assert_eq!(bus.share_context(AgentId(1), &[AgentId(2)], data), 0);
        assert!(matches!(b.try_recv().unwrap().kind, MessageKind::ContextShare { .. }));
    }

    #[test]
    fn test_message_kind_serialization() {
        let kind = MessageKind::Escalation {
            escalation_id: Uuid::nil(),
            issue_type: "x".into(),
            data: serde_json::Value::Null,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "escalation");
        assert_eq!(kind.name(), "escalation");
    }
}
