//! Agent hierarchy manager.
//!
//! A single actor task owns every agent handle, the in-flight table and the
//! spawn backlog; callers talk to it through [`HierarchyManager`], a cheap
//! clonable handle that sends commands over an mpsc channel and awaits
//! oneshot replies. The [`AgentRegistry`] lives behind a `parking_lot`
//! lock so status reads never wait on the actor. Only the actor writes it.
//!
//! Outcome channels for dispatched sub-tasks are held here rather than by
//! the agents, so reassigning a sub-task after a failure neither loses nor
//! duplicates its result: reports from an agent that no longer owns the
//! sub-task are discarded.

use crate::agent::{spawn_agent, AgentCommand, AgentEvent, AgentHandle, AgentSpec, TaskEnvelope};
use crate::bus::{CommunicationBus, HelpRouter, Mailbox, MessageKind, EXECUTIVE_TOPIC};
use crate::config::OrchestratorConfig;
use crate::health::{classify_heartbeat, HealthState};
use crate::spawner::{PoolSpawner, SpawnDecision};
use crate::specialists::SpecialistRegistry;
use crate::types::{AgentRecord, AgentStatus, WorkflowPlan};
use async_trait::async_trait;
use chrono::Utc;
use maestro_channels::NotifierManager;
use maestro_core::{
    AgentId, AgentLayer, AssignmentReason, MaestroError, MaestroResult, NotificationEvent,
    OutputStatus, Priority, SpecialistOutput, Specialty,
};
use maestro_security::{AuditLog, AuditOutcome};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// --- Registry ---

/// Arena of agent records with an id index. Freed slots are reused.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    slots: Vec<Option<AgentRecord>>,
    index: HashMap<AgentId, usize>,
    free: Vec<usize>,
    next_id: u64,
    /// Dispatched sub-tasks waiting for a free agent.
    queued_tasks: usize,
    /// Spawn requests waiting for pool capacity.
    spawn_backlog: usize,
}

impl AgentRegistry {
    /// An empty registry whose first id is 1; id 0 is reserved for system messages.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    fn insert(&mut self, layer: AgentLayer, specialty: Specialty) -> AgentId {
        let id = AgentId(self.next_id);
        self.next_id += 1;
        let record = Some(AgentRecord::new(id, layer, specialty));
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = record;
                slot
            }
            None => {
                self.slots.push(record);
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        id
    }

    fn remove(&mut self, id: AgentId) -> Option<AgentRecord> {
        let slot = self.index.remove(&id)?;
        self.free.push(slot);
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// Record of a registered agent.
    pub fn get(&self, id: AgentId) -> Option<&AgentRecord> {
        self.index
            .get(&id)
            .and_then(|slot| self.slots.get(*slot))
            .and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: AgentId) -> Option<&mut AgentRecord> {
        let slot = *self.index.get(&id)?;
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Every record, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Number of registered agents, failed ones included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live agents of a layer and specialty.
    pub fn live_count(&self, layer: AgentLayer, specialty: &Specialty) -> usize {
        self.iter()
            .filter(|r| r.layer == layer && &r.specialty == specialty && r.status.is_live())
            .count()
    }

    fn live_workers(&self, specialty: &Specialty) -> usize {
        self.live_count(AgentLayer::Specialist, specialty) + self.live_count(AgentLayer::Execution, specialty)
    }

    fn live_layer(&self, layer: AgentLayer) -> usize {
        self.iter()
            .filter(|r| r.layer == layer && r.status.is_live())
            .count()
    }

    fn live_specialists(&self) -> HashMap<Specialty, usize> {
        let mut counts = HashMap::new();
        for r in self.iter() {
            if r.layer == AgentLayer::Specialist && r.status.is_live() {
                *counts.entry(r.specialty.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

// --- Public reports ---

/// A sub-task the caller wants placed on an agent.
#[derive(Debug, Clone)]
pub struct AssignRequest {
    /// Sub-task to place.
    pub task_id: Uuid,
    /// Specialty the sub-task needs.
    pub specialty: Specialty,
    /// Critical requests may create burst agents.
    pub priority: Priority,
}

/// Final report of a dispatched sub-task attempt.
#[derive(Debug)]
pub struct TaskOutcome {
    /// Sub-task the attempt belongs to.
    pub task_id: Uuid,
    /// Agent that produced the result.
    pub agent_id: AgentId,
    /// Attempt number as dispatched.
    pub attempt: u32,
    /// What the specialist returned, or why no agent could.
    pub result: MaestroResult<SpecialistOutput>,
    /// Times the attempt moved to another agent after a failure.
    pub reassignments: u32,
    /// Agents that failed while holding this attempt, oldest first.
    pub failed_agents: Vec<AgentId>,
    /// Wall time of the final run.
    pub duration_ms: u64,
}

/// Result of asking for a new specialist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum SpawnOutcome {
    /// A new agent was registered.
    Created(AgentId),
    /// Waiting for pool capacity at this backlog position.
    Queued(usize),
}

/// What a self-heal pass did for one failed agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealReport {
    /// The failed agent, if it was still registered.
    pub agent_id: Option<AgentId>,
    /// `(task, new agent)` pairs.
    pub reassigned: Vec<(Uuid, AgentId)>,
    /// Sub-tasks left waiting for capacity.
    pub queued: Vec<Uuid>,
    /// Agent spawned to keep the pool at its minimum.
    pub replacement: Option<AgentId>,
    /// Time from detection to the last reassignment.
    pub elapsed_ms: u64,
    /// Whether recovery finished inside the configured window.
    pub within_window: bool,
}

/// What one heartbeat sweep changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Agents found past the heartbeat timeout and healed.
    pub failed: Vec<AgentId>,
    /// Agents that newly crossed half the timeout.
    pub degraded: Vec<AgentId>,
    /// Idle agents stopped.
    pub retired: Vec<AgentId>,
    /// Agents created from the spawn backlog.
    pub spawned: Vec<AgentId>,
}

/// Registered agents by heartbeat health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCounts {
    /// Heartbeat within half the timeout.
    pub healthy: usize,
    /// Heartbeat older than half the timeout.
    pub degraded: usize,
    /// Marked failed and not yet purged.
    pub failed: usize,
}

/// Aggregate view of the hierarchy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HierarchyStatus {
    /// Live agents per layer.
    pub by_layer: BTreeMap<AgentLayer, usize>,
    /// Live worker agents per specialty.
    pub by_specialty: BTreeMap<Specialty, usize>,
    /// Agents by heartbeat health.
    pub by_health: HealthCounts,
    /// Dispatched attempts waiting for a free agent.
    pub queued_tasks: usize,
    /// Spawn requests waiting for pool capacity.
    pub spawn_backlog: usize,
}

impl HierarchyStatus {
    /// Live agents across all layers.
    pub fn live_agents(&self) -> usize {
        self.by_layer.values().sum()
    }
}

// --- Commands ---

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Assign {
        requests: Vec<AssignRequest>,
        reply: Reply<MaestroResult<HashMap<Uuid, AgentId>>>,
    },
    Dispatch {
        envelope: TaskEnvelope,
        reply: Reply<MaestroResult<oneshot::Receiver<TaskOutcome>>>,
    },
    CreateSpecialist {
        specialty: Specialty,
        urgency: Priority,
        reply: Reply<MaestroResult<SpawnOutcome>>,
    },
    SelfHeal {
        agent: AgentId,
        reply: Reply<MaestroResult<HealReport>>,
    },
    CancelTasks {
        task_ids: Vec<Uuid>,
        reply: Reply<()>,
    },
    KillAgent {
        agent: AgentId,
        reply: Reply<bool>,
    },
    Sweep {
        reply: Reply<SweepReport>,
    },
    RetireIdle {
        reply: Reply<Vec<AgentId>>,
    },
    Locate {
        specialty: Specialty,
        requester: AgentId,
        reply: Reply<MaestroResult<AgentId>>,
    },
    RegisterManager {
        execution_id: Uuid,
        reply: Reply<(AgentId, Mailbox)>,
    },
    ReleaseManager {
        agent: AgentId,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// One audit entry per affected execution, or a single unscoped one.
fn audit_scope(executions: &BTreeSet<Uuid>) -> Vec<Option<Uuid>> {
    if executions.is_empty() {
        vec![None]
    } else {
        executions.iter().copied().map(Some).collect()
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

fn stopped() -> MaestroError {
    MaestroError::permanent("hierarchy manager stopped")
}

// --- Handle ---

/// Handle to the hierarchy actor.
#[derive(Clone)]
pub struct HierarchyManager {
    tx: mpsc::UnboundedSender<Command>,
    registry: Arc<RwLock<AgentRegistry>>,
    executive: AgentId,
}

impl HierarchyManager {
    /// Start the actor, the executive agent and each pool's minimum.
    pub fn start(
        config: OrchestratorConfig,
        specialists: SpecialistRegistry,
        bus: CommunicationBus,
        audit: AuditLog,
        notifier: Arc<NotifierManager>,
    ) -> Self {
        let registry = Arc::new(RwLock::new(AgentRegistry::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let executive = registry
            .write()
            .insert(AgentLayer::Executive, Specialty::Executive);
        let exec_mailbox = bus.register(executive);
        bus.subscribe(executive, EXECUTIVE_TOPIC);

        let mut actor = Actor {
            spawner: PoolSpawner::new(&config),
            config,
            specialists,
            bus,
            audit,
            notifier,
            registry: Arc::clone(&registry),
            handles: HashMap::new(),
            owners: HashMap::new(),
            in_flight: HashMap::new(),
            waiting: VecDeque::new(),
            events_tx,
            epoch: Instant::now(),
        };
        actor.prespawn();
        tokio::spawn(actor.run(rx, events_rx, exec_mailbox));
        info!(executive = %executive, "Hierarchy manager started");

        Self {
            tx,
            registry,
            executive,
        }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> MaestroResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Id of the executive agent, which receives escalations.
    pub fn executive(&self) -> AgentId {
        self.executive
    }

    /// Reserve agents for every ready, unassigned sub-task of a plan.
    pub async fn assign(&self, plan: &WorkflowPlan) -> MaestroResult<HashMap<Uuid, AgentId>> {
        let requests = plan
            .ready_unassigned()
            .into_iter()
            .map(|t| AssignRequest {
                task_id: t.id,
                specialty: t.specialty.clone(),
                priority: t.priority,
            })
            .collect();
        self.assign_ready(requests).await
    }

    /// Reserve agents for the given ready sub-tasks, in the given order.
    /// Sub-tasks whose specialty is saturated are left out of the map.
    pub async fn assign_ready(&self, requests: Vec<AssignRequest>) -> MaestroResult<HashMap<Uuid, AgentId>> {
        self.call(|reply| Command::Assign { requests, reply }).await?
    }

    /// Hand a sub-task attempt to its reserved agent (or any capable one).
    /// The receiver resolves once some agent finishes the attempt.
    pub async fn dispatch(&self, envelope: TaskEnvelope) -> MaestroResult<oneshot::Receiver<TaskOutcome>> {
        self.call(|reply| Command::Dispatch { envelope, reply }).await?
    }

    /// Create a specialist now, or queue the request when the pool is full.
    pub async fn create_specialist(&self, specialty: Specialty, urgency: Priority) -> MaestroResult<SpawnOutcome> {
        self.call(|reply| Command::CreateSpecialist {
            specialty,
            urgency,
            reply,
        })
        .await?
    }

    /// Reassign the work of a failed agent and replace it if the pool fell below its minimum.
    pub async fn self_heal(&self, agent: AgentId) -> MaestroResult<HealReport> {
        self.call(|reply| Command::SelfHeal { agent, reply }).await?
    }

    /// Cancel reserved, queued or running sub-tasks.
    pub async fn cancel_tasks(&self, task_ids: Vec<Uuid>) -> MaestroResult<()> {
        self.call(|reply| Command::CancelTasks { task_ids, reply }).await
    }

    /// Crash an agent for fault-injection. Detection happens on the next
    /// heartbeat sweep.
    pub async fn kill_agent(&self, agent: AgentId) -> MaestroResult<bool> {
        self.call(|reply| Command::KillAgent { agent, reply }).await
    }

    /// Heartbeat check, retirement and backlog drain.
    pub async fn sweep(&self) -> MaestroResult<SweepReport> {
        self.call(|reply| Command::Sweep { reply }).await
    }

    /// Stop idle workers past the retirement window.
    pub async fn retire_idle(&self) -> MaestroResult<Vec<AgentId>> {
        self.call(|reply| Command::RetireIdle { reply }).await
    }

    /// Find (or create) an agent to help with `specialty`.
    pub async fn locate(&self, specialty: Specialty, requester: AgentId) -> MaestroResult<AgentId> {
        self.call(|reply| Command::Locate {
            specialty,
            requester,
            reply,
        })
        .await?
    }

    /// Create a management-layer coordinator for one workflow.
    pub async fn register_manager(&self, execution_id: Uuid) -> MaestroResult<(AgentId, Mailbox)> {
        self.call(|reply| Command::RegisterManager { execution_id, reply }).await
    }

    /// Stop a workflow's coordinator. Fire and forget.
    pub fn release_manager(&self, agent: AgentId) {
        let _ = self.tx.send(Command::ReleaseManager { agent });
    }

    /// Stop every agent and the actor itself.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }

    /// Snapshot of one agent.
    pub fn agent(&self, id: AgentId) -> Option<AgentRecord> {
        self.registry.read().get(id).cloned()
    }

    /// Snapshot of every registered agent.
    pub fn agents(&self) -> Vec<AgentRecord> {
        self.registry.read().iter().cloned().collect()
    }

    /// Aggregate counts by layer, specialty and health.
    pub fn status(&self) -> HierarchyStatus {
        let registry = self.registry.read();
        let mut status = HierarchyStatus {
            queued_tasks: registry.queued_tasks,
            spawn_backlog: registry.spawn_backlog,
            ..Default::default()
        };
        for record in registry.iter() {
            match record.status {
                AgentStatus::Failed => status.by_health.failed += 1,
                AgentStatus::Degraded => status.by_health.degraded += 1,
                _ => status.by_health.healthy += 1,
            }
            if !record.status.is_live() {
                continue;
            }
            *status.by_layer.entry(record.layer).or_insert(0) += 1;
            if matches!(record.layer, AgentLayer::Specialist | AgentLayer::Execution) {
                *status
                    .by_specialty
                    .entry(record.specialty.clone())
                    .or_insert(0) += 1;
            }
        }
        status
    }
}

#[async_trait]
impl HelpRouter for HierarchyManager {
    async fn locate_helper(&self, specialty: &Specialty, requester: AgentId) -> MaestroResult<AgentId> {
        self.locate(specialty.clone(), requester).await
    }
}

// --- Actor ---

struct Flight {
    envelope: TaskEnvelope,
    reply: oneshot::Sender<TaskOutcome>,
    failed_agents: Vec<AgentId>,
}

impl Flight {
    fn resolve(self, agent_id: AgentId, result: MaestroResult<SpecialistOutput>, duration_ms: u64) {
        let _ = self.reply.send(TaskOutcome {
            task_id: self.envelope.task_id,
            agent_id,
            attempt: self.envelope.attempt,
            result,
            reassignments: u32::try_from(self.failed_agents.len()).unwrap_or(u32::MAX),
            failed_agents: self.failed_agents,
            duration_ms,
        });
    }
}

struct Actor {
    config: OrchestratorConfig,
    specialists: SpecialistRegistry,
    bus: CommunicationBus,
    audit: AuditLog,
    notifier: Arc<NotifierManager>,
    registry: Arc<RwLock<AgentRegistry>>,
    spawner: PoolSpawner,
    handles: HashMap<AgentId, AgentHandle>,
    /// Agent holding each reserved or running sub-task.
    owners: HashMap<Uuid, AgentId>,
    in_flight: HashMap<Uuid, Flight>,
    /// Dispatched attempts with no agent yet.
    waiting: VecDeque<Flight>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    epoch: Instant,
}

impl Actor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<AgentEvent>,
        mut exec_mailbox: Mailbox,
    ) {
        let mut mailbox_open = true;
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
                message = exec_mailbox.recv(), if mailbox_open => match message {
                    Some(msg) => self.on_executive_message(msg.sender, msg.kind),
                    None => mailbox_open = false,
                },
            }
            self.publish_counts();
        }
        debug!("Hierarchy actor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Assign { requests, reply } => {
                let _ = reply.send(self.assign(requests));
            }
            Command::Dispatch { envelope, reply } => {
                let _ = reply.send(self.dispatch(envelope));
            }
            Command::CreateSpecialist {
                specialty,
                urgency,
                reply,
            } => {
                let _ = reply.send(self.create_specialist(specialty, urgency));
            }
            Command::SelfHeal { agent, reply } => {
                let _ = reply.send(self.self_heal(agent));
            }
            Command::CancelTasks { task_ids, reply } => {
                self.cancel_tasks(&task_ids);
                let _ = reply.send(());
            }
            Command::KillAgent { agent, reply } => {
                let found = self.handles.get(&agent).map(AgentHandle::kill).is_some();
                let _ = reply.send(found);
            }
            Command::Sweep { reply } => {
                let _ = reply.send(self.sweep());
            }
            Command::RetireIdle { reply } => {
                let _ = reply.send(self.retire_idle());
            }
            Command::Locate {
                specialty,
                requester,
                reply,
            } => {
                let _ = reply.send(self.locate(&specialty, requester));
            }
            Command::RegisterManager { execution_id, reply } => {
                let id = {
                    let mut registry = self.registry.write();
                    let id = registry.insert(AgentLayer::Management, Specialty::Coordination);
                    if let Some(record) = registry.get_mut(id) {
                        record.execution_id = Some(execution_id);
                        record.status = AgentStatus::Busy;
                    }
                    id
                };
                let mailbox = self.bus.register(id);
                debug!(agent_id = %id, execution_id = %execution_id, "Manager registered");
                let _ = reply.send((id, mailbox));
            }
            Command::ReleaseManager { agent } => {
                self.bus.unregister(agent);
                self.registry.write().remove(agent);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn publish_counts(&self) {
        let mut registry = self.registry.write();
        registry.queued_tasks = self.waiting.len();
        registry.spawn_backlog = self.spawner.backlog_len();
    }

    fn notify(&self, event: NotificationEvent) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            notifier.broadcast(&event).await;
        });
    }

    fn prespawn(&mut self) {
        for (specialty, min) in self.spawner.minimums() {
            if !self.specialists.contains(&specialty) {
                warn!(specialty = %specialty, "Pool minimum configured for a specialty without handler");
                continue;
            }
            for _ in 0..min {
                self.spawn(&specialty, AgentLayer::Specialist);
            }
        }
    }

    fn spawn(&mut self, specialty: &Specialty, layer: AgentLayer) -> Option<AgentId> {
        let handler = self.specialists.get(specialty)?;
        let id = self.registry.write().insert(layer, specialty.clone());
        let handle = spawn_agent(
            AgentSpec {
                id,
                layer,
                specialty: specialty.clone(),
                max_tasks: self.config.max_tasks_per_agent,
                heartbeat_interval: self.config.heartbeat_interval(),
            },
            handler,
            self.bus.clone(),
            self.events_tx.clone(),
            self.epoch,
        );
        self.handles.insert(id, handle);
        Some(id)
    }

    /// Least-loaded live agent with spare capacity. Healthy beats degraded,
    /// then lower load, then higher success rate, then lower id.
    fn select_agent(&self, specialty: &Specialty, exclude: Option<AgentId>) -> Option<AgentId> {
        let registry = self.registry.read();
        registry
            .iter()
            .filter(|r| {
                matches!(r.layer, AgentLayer::Specialist | AgentLayer::Execution)
                    && &r.specialty == specialty
                    && r.status.is_live()
                    && Some(r.id) != exclude
                    && r.load() < self.config.max_tasks_per_agent
                    && self.handles.contains_key(&r.id)
            })
            .min_by(|a, b| {
                let degraded = |r: &AgentRecord| r.status == AgentStatus::Degraded;
                degraded(a)
                    .cmp(&degraded(b))
                    .then(a.load().cmp(&b.load()))
                    .then(
                        b.history
                            .success_rate()
                            .total_cmp(&a.history.success_rate()),
                    )
                    .then(a.id.cmp(&b.id))
            })
            .map(|r| r.id)
    }

    /// An agent able to take one more sub-task now, creating one when the
    /// pool allows. `Ok(None)` means the specialty is saturated.
    fn acquire(
        &mut self,
        specialty: &Specialty,
        urgency: Priority,
        exclude: Option<AgentId>,
    ) -> Result<Option<AgentId>, AssignmentReason> {
        if !self.specialists.contains(specialty) {
            return Err(AssignmentReason::NoCapableAgent);
        }
        if let Some(id) = self.select_agent(specialty, exclude) {
            return Ok(Some(id));
        }
        let (live, burst, workers) = {
            let registry = self.registry.read();
            (
                registry.live_count(AgentLayer::Specialist, specialty),
                registry.live_layer(AgentLayer::Execution),
                registry.live_workers(specialty),
            )
        };
        match self.spawner.decide(specialty, urgency, live, burst) {
            SpawnDecision::Create(layer) => Ok(self.spawn(specialty, layer)),
            SpawnDecision::Queue if workers == 0 => Err(AssignmentReason::PoolExhausted),
            SpawnDecision::Queue => Ok(None),
        }
    }

    fn reserve(&mut self, agent: AgentId, task_id: Uuid) {
        if let Some(record) = self.registry.write().get_mut(agent) {
            record.current_tasks.insert(task_id);
            record.last_active = Utc::now();
            if record.status == AgentStatus::Idle {
                record.status = AgentStatus::Assigned;
            }
        }
        self.owners.insert(task_id, agent);
    }

    fn release(&mut self, agent: AgentId, task_id: Uuid) {
        if let Some(record) = self.registry.write().get_mut(agent) {
            record.current_tasks.remove(&task_id);
            record.last_active = Utc::now();
            if record.current_tasks.is_empty()
                && matches!(record.status, AgentStatus::Assigned | AgentStatus::Busy)
            {
                record.status = AgentStatus::Idle;
            }
        }
        if self.owners.get(&task_id) == Some(&agent) {
            self.owners.remove(&task_id);
        }
    }

    fn assign(&mut self, requests: Vec<AssignRequest>) -> MaestroResult<HashMap<Uuid, AgentId>> {
        let mut assigned = HashMap::new();
        for request in requests {
            if let Some(agent) = self.owners.get(&request.task_id) {
                assigned.insert(request.task_id, *agent);
                continue;
            }
            match self.acquire(&request.specialty, request.priority, None) {
                Ok(Some(agent)) => {
                    self.reserve(agent, request.task_id);
                    assigned.insert(request.task_id, agent);
                }
                Ok(None) => {
                    debug!(task_id = %request.task_id, specialty = %request.specialty, "Specialty saturated, sub-task stays queued");
                }
                Err(reason) => {
                    for (task_id, agent) in &assigned {
                        if !self.in_flight.contains_key(task_id) {
                            self.release(*agent, *task_id);
                        }
                    }
                    return Err(MaestroError::Assignment {
                        reason,
                        specialty: request.specialty,
                    });
                }
            }
        }
        Ok(assigned)
    }

    fn dispatch(&mut self, envelope: TaskEnvelope) -> MaestroResult<oneshot::Receiver<TaskOutcome>> {
        let task_id = envelope.task_id;
        if self.in_flight.contains_key(&task_id) {
            return Err(MaestroError::permanent(format!("sub-task {task_id} is already running")));
        }
        let reserved = self
            .owners
            .get(&task_id)
            .copied()
            .filter(|agent| self.handles.contains_key(agent));
        let agent = match reserved {
            Some(agent) => Some(agent),
            None => {
                let agent = self
                    .acquire(&envelope.specialty, envelope.priority, None)
                    .map_err(|reason| MaestroError::Assignment {
                        reason,
                        specialty: envelope.specialty.clone(),
                    })?;
                if let Some(agent) = agent {
                    self.reserve(agent, task_id);
                }
                agent
            }
        };

        let (reply, rx) = oneshot::channel();
        let flight = Flight {
            envelope,
            reply,
            failed_agents: Vec::new(),
        };
        match agent {
            Some(agent) => self.launch(agent, flight),
            None => self.waiting.push_back(flight),
        }
        Ok(rx)
    }

    fn launch(&mut self, agent: AgentId, flight: Flight) {
        let task_id = flight.envelope.task_id;
        let sent = self
            .handles
            .get(&agent)
            .map(|h| h.send(AgentCommand::Execute(flight.envelope.clone())));
        self.in_flight.insert(task_id, flight);
        debug!(task_id = %task_id, agent_id = %agent, "Sub-task dispatched");
        if !matches!(sent, Some(Ok(()))) {
            warn!(agent_id = %agent, "Agent unreachable at dispatch, healing");
            if let Err(e) = self.self_heal(agent) {
                error!(agent_id = %agent, error = %e, "Self-heal failed");
            }
        }
    }

    fn drain_waiting(&mut self) {
        let mut still_waiting = VecDeque::new();
        while let Some(flight) = self.waiting.pop_front() {
            let env = &flight.envelope;
            match self.acquire(&env.specialty.clone(), env.priority, None) {
                Ok(Some(agent)) => {
                    self.reserve(agent, flight.envelope.task_id);
                    self.launch(agent, flight);
                }
                Ok(None) => still_waiting.push_back(flight),
                Err(reason) => {
                    let specialty = flight.envelope.specialty.clone();
                    flight.resolve(AgentId(0), Err(MaestroError::Assignment { reason, specialty }), 0);
                }
            }
        }
        self.waiting = still_waiting;
    }

    fn on_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Started { agent_id, task_id } => {
                if self.owners.get(&task_id) != Some(&agent_id) {
                    return;
                }
                if let Some(record) = self.registry.write().get_mut(agent_id) {
                    if record.status != AgentStatus::Degraded {
                        record.status = AgentStatus::Busy;
                    }
                    record.last_active = Utc::now();
                }
            }
            AgentEvent::Finished(finished) => {
                if self.owners.get(&finished.task_id) != Some(&finished.agent_id)
                    || !self.in_flight.contains_key(&finished.task_id)
                {
                    debug!(
                        task_id = %finished.task_id,
                        agent_id = %finished.agent_id,
                        "Discarding report from non-owner"
                    );
                    return;
                }
                let Some(flight) = self.in_flight.remove(&finished.task_id) else {
                    return;
                };
                self.release(finished.agent_id, finished.task_id);

                let success = match &finished.result {
                    Ok(output) => Some(output.status == OutputStatus::Completed),
                    Err(MaestroError::Cancelled(_)) => None,
                    Err(_) => Some(false),
                };
                if let Some(success) = success {
                    if let Some(record) = self.registry.write().get_mut(finished.agent_id) {
                        record.history.record(success);
                    }
                }

                flight.resolve(finished.agent_id, finished.result, finished.duration_ms);
                self.drain_waiting();
            }
        }
    }

    fn on_executive_message(&mut self, sender: AgentId, kind: MessageKind) {
        match kind {
            MessageKind::Escalation {
                escalation_id,
                issue_type,
                data,
            } => {
                warn!(
                    escalation_id = %escalation_id,
                    agent_id = %sender,
                    issue_type = %issue_type,
                    "Executive received escalation"
                );
                self.notify(NotificationEvent::Escalation {
                    escalation_id,
                    agent_id: sender,
                    issue_type,
                    data,
                    at: Utc::now(),
                });
            }
            other => debug!(kind = other.name(), "Executive ignored message"),
        }
    }

    fn create_specialist(&mut self, specialty: Specialty, urgency: Priority) -> MaestroResult<SpawnOutcome> {
        if !self.specialists.contains(&specialty) {
            return Err(MaestroError::Assignment {
                reason: AssignmentReason::NoCapableAgent,
                specialty,
            });
        }
        let (live, burst) = {
            let registry = self.registry.read();
            (
                registry.live_count(AgentLayer::Specialist, &specialty),
                registry.live_layer(AgentLayer::Execution),
            )
        };
        match self.spawner.decide(&specialty, urgency, live, burst) {
            SpawnDecision::Create(layer) => self
                .spawn(&specialty, layer)
                .map(SpawnOutcome::Created)
                .ok_or_else(|| MaestroError::Assignment {
                    reason: AssignmentReason::NoCapableAgent,
                    specialty,
                }),
            SpawnDecision::Queue => {
                let position = self.spawner.enqueue(specialty.clone(), urgency);
                info!(specialty = %specialty, position, "Spawn request queued");
                Ok(SpawnOutcome::Queued(position))
            }
        }
    }

    fn self_heal(&mut self, agent: AgentId) -> MaestroResult<HealReport> {
        let started = Instant::now();
        let (specialty, layer) = {
            let mut registry = self.registry.write();
            let record = registry
                .get_mut(agent)
                .ok_or_else(|| MaestroError::NotFound(format!("agent {agent}")))?;
            if record.status == AgentStatus::Failed {
                return Ok(HealReport {
                    agent_id: Some(agent),
                    within_window: true,
                    ..Default::default()
                });
            }
            record.status = AgentStatus::Failed;
            record.current_tasks.clear();
            record.last_active = Utc::now();
            record.history.record(false);
            (record.specialty.clone(), record.layer)
        };
        if let Some(handle) = self.handles.remove(&agent) {
            handle.stop();
            handle.kill();
        }
        self.bus.unregister(agent);

        let mut report = HealReport {
            agent_id: Some(agent),
            ..Default::default()
        };

        // reservations that never started are simply released
        let mut executions: BTreeSet<Uuid> = BTreeSet::new();
        let orphaned: Vec<Uuid> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == agent)
            .map(|(task, _)| *task)
            .collect();
        for task_id in orphaned {
            self.owners.remove(&task_id);
            let Some(mut flight) = self.in_flight.remove(&task_id) else {
                continue;
            };
            flight.failed_agents.push(agent);
            executions.insert(flight.envelope.execution_id);
            let env = &flight.envelope;
            match self.acquire(&env.specialty.clone(), env.priority, Some(agent)) {
                Ok(Some(next)) => {
                    self.reserve(next, task_id);
                    report.reassigned.push((task_id, next));
                    self.launch(next, flight);
                }
                Ok(None) | Err(_) => {
                    report.queued.push(task_id);
                    self.waiting.push_back(flight);
                }
            }
        }

        if layer == AgentLayer::Specialist {
            let live = self
                .registry
                .read()
                .live_count(AgentLayer::Specialist, &specialty);
            if self.spawner.deficit(&specialty, live) > 0 {
                report.replacement = self.spawn(&specialty, AgentLayer::Specialist);
            }
        }
        self.drain_backlog();

        let elapsed = started.elapsed();
        report.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        report.within_window = elapsed <= self.config.recovery_window();
        if !report.within_window {
            warn!(
                agent_id = %agent,
                elapsed_ms = report.elapsed_ms,
                window_ms = self.config.recovery_window_ms,
                "Recovery window exceeded"
            );
            for execution_id in audit_scope(&executions) {
                self.audit.log_action(
                    execution_id,
                    Some(agent),
                    "recovery_window_exceeded",
                    serde_json::json!({ "elapsed_ms": report.elapsed_ms }),
                    AuditOutcome::Failure,
                );
            }
        }

        info!(
            agent_id = %agent,
            specialty = %specialty,
            reassigned = report.reassigned.len(),
            queued = report.queued.len(),
            "Agent healed"
        );
        let details = serde_json::json!({
            "specialty": specialty,
            "reassigned": report.reassigned,
            "queued": report.queued,
            "replacement": report.replacement,
        });
        for execution_id in audit_scope(&executions) {
            self.audit.log_action(
                execution_id,
                Some(agent),
                "self_heal",
                details.clone(),
                AuditOutcome::Success,
            );
        }
        self.notify(NotificationEvent::AgentFailed {
            agent_id: agent,
            specialty,
            reassigned_tasks: report.reassigned.len() + report.queued.len(),
            at: Utc::now(),
        });
        Ok(report)
    }

    fn cancel_tasks(&mut self, task_ids: &[Uuid]) {
        for task_id in task_ids {
            if self.in_flight.contains_key(task_id) {
                if let Some(agent) = self.owners.get(task_id) {
                    if let Some(handle) = self.handles.get(agent) {
                        let _ = handle.send(AgentCommand::Cancel(*task_id));
                    }
                }
                continue;
            }
            if let Some(pos) = self.waiting.iter().position(|f| f.envelope.task_id == *task_id) {
                if let Some(flight) = self.waiting.remove(pos) {
                    flight.resolve(AgentId(0), Err(MaestroError::Cancelled(format!("task {task_id}"))), 0);
                }
                continue;
            }
            if let Some(agent) = self.owners.get(task_id).copied() {
                self.release(agent, *task_id);
            }
        }
    }

    fn locate(&mut self, specialty: &Specialty, requester: AgentId) -> MaestroResult<AgentId> {
        match self.acquire(specialty, Priority::High, Some(requester)) {
            Ok(Some(agent)) => Ok(agent),
            Ok(None) => {
                // everyone is saturated; help is a side job, so any live agent will do
                let registry = self.registry.read();
                registry
                    .iter()
                    .filter(|r| {
                        &r.specialty == specialty
                            && r.status.is_live()
                            && r.id != requester
                            && self.handles.contains_key(&r.id)
                    })
                    .min_by_key(|r| (r.load(), r.id))
                    .map(|r| r.id)
                    .ok_or(MaestroError::Assignment {
                        reason: AssignmentReason::PoolExhausted,
                        specialty: specialty.clone(),
                    })
            }
            Err(reason) => Err(MaestroError::Assignment {
                reason,
                specialty: specialty.clone(),
            }),
        }
    }

    fn sweep(&mut self) -> SweepReport {
        let mut report = SweepReport::default();
        let timeout = self.config.heartbeat_timeout();
        let ages: Vec<(AgentId, std::time::Duration)> = self
            .handles
            .values()
            .map(|h| (h.id, h.heartbeat_age()))
            .collect();

        for (agent, age) in ages {
            let state = classify_heartbeat(age, timeout);
            {
                let mut registry = self.registry.write();
                let Some(record) = registry.get_mut(agent) else {
                    continue;
                };
                record.last_heartbeat =
                    Utc::now() - to_chrono(age);
                match state {
                    HealthState::Healthy if record.status == AgentStatus::Degraded => {
                        record.status = if record.current_tasks.is_empty() {
                            AgentStatus::Idle
                        } else {
                            AgentStatus::Busy
                        };
                        info!(agent_id = %agent, "Agent recovered");
                    }
                    HealthState::Degraded if record.status != AgentStatus::Degraded => {
                        record.status = AgentStatus::Degraded;
                        report.degraded.push(agent);
                        warn!(agent_id = %agent, age_ms = age.as_millis() as u64, "Agent degraded");
                    }
                    _ => {}
                }
            }
            if state == HealthState::Failed {
                error!(agent_id = %agent, age_ms = age.as_millis() as u64, "Agent missed heartbeat");
                report.failed.push(agent);
                if let Err(e) = self.self_heal(agent) {
                    error!(agent_id = %agent, error = %e, "Self-heal failed");
                }
            }
        }

        report.retired = self.retire_idle();
        report.spawned = self.drain_backlog();
        self.drain_waiting();
        self.purge_failed();
        let expired_help = self.bus.sweep_help();
        if expired_help > 0 {
            debug!(expired = expired_help, "Expired unanswered help requests");
        }
        report
    }

    /// Stop idle workers past the retirement window (pool minimum kept) and
    /// idle burst agents.
    fn retire_idle(&mut self) -> Vec<AgentId> {
        let window = to_chrono(self.config.retirement_window());
        let now = Utc::now();
        let candidates: Vec<(AgentId, AgentLayer, Specialty)> = self
            .registry
            .read()
            .iter()
            .filter(|r| {
                r.status == AgentStatus::Idle
                    && r.current_tasks.is_empty()
                    && self.handles.contains_key(&r.id)
                    && match r.layer {
                        AgentLayer::Execution => true,
                        AgentLayer::Specialist => now - r.last_active > window,
                        _ => false,
                    }
            })
            .map(|r| (r.id, r.layer, r.specialty.clone()))
            .collect();

        let mut retired = Vec::new();
        for (agent, layer, specialty) in candidates {
            if layer == AgentLayer::Specialist {
                let live = self
                    .registry
                    .read()
                    .live_count(AgentLayer::Specialist, &specialty);
                if !self.spawner.can_retire(&specialty, live) {
                    continue;
                }
            }
            if let Some(handle) = self.handles.remove(&agent) {
                handle.stop();
            }
            self.bus.unregister(agent);
            self.registry.write().remove(agent);
            info!(agent_id = %agent, specialty = %specialty, "Agent retired");
            retired.push(agent);
        }
        if !retired.is_empty() {
            self.drain_backlog();
        }
        retired
    }

    fn drain_backlog(&mut self) -> Vec<AgentId> {
        let live = self.registry.read().live_specialists();
        self.spawner
            .drain_ready(&live)
            .into_iter()
            .filter_map(|request| self.spawn(&request.specialty, AgentLayer::Specialist))
            .collect()
    }

    /// Forget failed agents once the retirement window has passed.
    fn purge_failed(&mut self) {
        let window = to_chrono(self.config.retirement_window());
        let now = Utc::now();
        let expired: Vec<AgentId> = self
            .registry
            .read()
            .iter()
            .filter(|r| r.status == AgentStatus::Failed && now - r.last_active > window)
            .map(|r| r.id)
            .collect();
        let mut registry = self.registry.write();
        for agent in expired {
            registry.remove(agent);
        }
    }

    fn shutdown(&mut self) {
        for (id, handle) in self.handles.drain() {
            handle.stop();
            self.bus.unregister(id);
        }
        for flight in self.waiting.drain(..) {
            flight.resolve(AgentId(0), Err(MaestroError::Cancelled("hierarchy shutting down".into())), 0);
        }
        self.in_flight.clear();
        info!("Hierarchy manager shut down");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, PoolLimits};
    use maestro_core::{SpecialistHandler, SpecialistInput, TaskContext};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Echo(Specialty, u64);

    #[async_trait]
    impl SpecialistHandler for Echo {
        fn specialty(&self) -> Specialty {
            self.0.clone()
        }

        async fn execute(&self, ctx: &TaskContext, input: SpecialistInput) -> MaestroResult<SpecialistOutput> {
            tokio::time::sleep(Duration::from_millis(self.1)).await;
            ctx.checkpoint()?;
            Ok(SpecialistOutput::completed(
                serde_json::json!({ "echo": input.description }),
                0.9,
            ))
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_tasks_per_agent: 1,
            heartbeat_interval_ms: 10,
            heartbeat_timeout_ms: 100,
            ..Default::default()
        }
    }

    fn start_with(config: OrchestratorConfig, delay_ms: u64) -> (HierarchyManager, AuditLog) {
        let specialists = SpecialistRegistry::new()
            .with(Arc::new(Echo(Specialty::Research, delay_ms)))
            .with(Arc::new(Echo(Specialty::Writing, delay_ms)));
        let audit = AuditLog::in_memory();
        let bus = CommunicationBus::new(BusConfig::default(), audit.clone());
        let manager = HierarchyManager::start(
            config,
            specialists,
            bus,
            audit.clone(),
            Arc::new(NotifierManager::new()),
        );
        (manager, audit)
    }

    fn envelope(task_id: Uuid, specialty: Specialty) -> TaskEnvelope {
        TaskEnvelope {
            execution_id: Uuid::nil(),
            task_id,
            specialty,
            priority: Priority::Normal,
            input: SpecialistInput {
                description: "work".into(),
                ..Default::default()
            },
            attempt: 1,
            cancel: CancellationToken::new(),
            timeout: Duration::from_secs(5),
        }
    }

    fn request(specialty: Specialty) -> AssignRequest {
        AssignRequest {
            task_id: Uuid::new_v4(),
            specialty,
            priority: Priority::Normal,
        }
    }

    #[test]
    fn test_registry_reuses_slots_but_not_ids() {
        let mut registry = AgentRegistry::new();
        let a = registry.insert(AgentLayer::Specialist, Specialty::Research);
        let b = registry.insert(AgentLayer::Specialist, Specialty::Research);
        assert_eq!((a, b), (AgentId(1), AgentId(2)));
        registry.remove(a);
        let c = registry.insert(AgentLayer::Specialist, Specialty::Data);
        assert_eq!(c, AgentId(3));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.slots.len(), 2);
        assert!(registry.get(a).is_none());
        assert_eq!(registry.get(c).unwrap().specialty, Specialty::Data);
    }

    #[tokio::test]
    async fn test_executive_created_at_start() {
        let (manager, _) = start_with(config(), 1);
        let status = manager.status();
        assert_eq!(status.by_layer.get(&AgentLayer::Executive), Some(&1));
        assert_eq!(manager.agent(manager.executive()).unwrap().layer, AgentLayer::Executive);
    }

    #[tokio::test]
    async fn test_assign_creates_agents_up_to_pool_max() {
        let mut cfg = config();
        cfg.pools.insert(Specialty::Research, PoolLimits { min: 0, max: 2 });
        let (manager, _) = start_with(cfg, 1);

        let requests: Vec<AssignRequest> = (0..3).map(|_| request(Specialty::Research)).collect();
        let third = requests[2].task_id;
        let assigned = manager.assign_ready(requests).await.unwrap();

        // one task per agent, pool max two: the third stays queued
        assert_eq!(assigned.len(), 2);
        assert!(!assigned.contains_key(&third));
        let agents: std::collections::HashSet<_> = assigned.values().collect();
        assert_eq!(agents.len(), 2);
        for agent in agents {
            assert_eq!(manager.agent(*agent).unwrap().status, AgentStatus::Assigned);
        }
    }

    #[tokio::test]
    async fn test_assign_without_handler_is_no_capable_agent() {
        let (manager, _) = start_with(config(), 1);
        let err = manager
            .assign_ready(vec![request(Specialty::Research), request(Specialty::Coding)])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Assignment error: no_capable_agent (coding)");
        // the research reservation was rolled back
        assert!(manager
            .agents()
            .iter()
            .all(|a| a.current_tasks.is_empty()));
    }

    #[tokio::test]
    async fn test_assign_with_empty_pool_is_pool_exhausted() {
        let mut cfg = config();
        cfg.pools.insert(Specialty::Research, PoolLimits { min: 0, max: 0 });
        let (manager, _) = start_with(cfg, 1);
        let err = manager
            .assign_ready(vec![request(Specialty::Research)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MaestroError::Assignment {
                reason: AssignmentReason::PoolExhausted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_least_loaded_then_lowest_id() {
        let mut cfg = config();
        cfg.max_tasks_per_agent = 3;
        cfg.pools.insert(Specialty::Writing, PoolLimits { min: 2, max: 2 });
        let (manager, _) = start_with(cfg, 1);

        let first = manager.assign_ready(vec![request(Specialty::Writing)]).await.unwrap();
        let second = manager.assign_ready(vec![request(Specialty::Writing)]).await.unwrap();
        let a = *first.values().next().unwrap();
        let b = *second.values().next().unwrap();
        assert!(a < b, "ties go to the lowest id");
        assert_ne!(a, b, "second pick goes to the less loaded agent");
    }

    #[tokio::test]
    async fn test_dispatch_runs_and_frees_agent() {
        let (manager, _) = start_with(config(), 5);
        let task_id = Uuid::new_v4();
        let assigned = manager
            .assign_ready(vec![AssignRequest {
                task_id,
                specialty: Specialty::Research,
                priority: Priority::Normal,
            }])
            .await
            .unwrap();
        let agent = assigned[&task_id];

        let rx = manager.dispatch(envelope(task_id, Specialty::Research)).await.unwrap();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.agent_id, agent);
        assert_eq!(outcome.reassignments, 0);
        assert!(outcome.result.is_ok());

        let record = manager.agent(agent).unwrap();
        assert_eq!(record.status, AgentStatus::Idle);
        assert_eq!(record.history.len(), 1);
    }

    #[tokio::test]
    async fn test_saturated_dispatch_waits_for_capacity() {
        let mut cfg = config();
        cfg.pools.insert(Specialty::Research, PoolLimits { min: 0, max: 1 });
        let (manager, _) = start_with(cfg, 30);

        let first = manager
            .dispatch(envelope(Uuid::new_v4(), Specialty::Research))
            .await
            .unwrap();
        let second = manager
            .dispatch(envelope(Uuid::new_v4(), Specialty::Research))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.status().queued_tasks, 1);

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(a.agent_id, b.agent_id);
        assert!(b.result.is_ok());
    }

    #[tokio::test]
    async fn test_killed_agent_is_healed_and_task_reassigned() {
        let (manager, audit) = start_with(config(), 300);
        let task_id = Uuid::new_v4();
        let rx = manager
            .dispatch(envelope(task_id, Specialty::Research))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let victim = manager
            .agents()
            .into_iter()
            .find(|a| a.current_tasks.contains(&task_id))
            .unwrap()
            .id;

        assert!(manager.kill_agent(victim).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let sweep = manager.sweep().await.unwrap();
        assert_eq!(sweep.failed, vec![victim]);

        let outcome = rx.await.unwrap();
        assert_ne!(outcome.agent_id, victim);
        assert_eq!(outcome.reassignments, 1);
        assert_eq!(outcome.failed_agents, vec![victim]);
        assert!(outcome.result.is_ok());
        assert_eq!(manager.agent(victim).unwrap().status, AgentStatus::Failed);
        assert_eq!(manager.status().by_health.failed, 1);
        let heal = audit
            .entries()
            .into_iter()
            .find(|e| e.action == "self_heal")
            .unwrap();
        assert_eq!(heal.execution_id, Some(Uuid::nil()));
    }

    #[tokio::test]
    async fn test_self_heal_spawns_replacement_below_minimum() {
        let mut cfg = config();
        cfg.pools.insert(Specialty::Writing, PoolLimits { min: 1, max: 2 });
        let (manager, _) = start_with(cfg, 1);
        tokio::task::yield_now().await;
        let writer = manager
            .agents()
            .into_iter()
            .find(|a| a.specialty == Specialty::Writing)
            .unwrap()
            .id;

        let report = manager.self_heal(writer).await.unwrap();
        assert!(report.within_window);
        let replacement = report.replacement.unwrap();
        assert_ne!(replacement, writer);
        assert_eq!(manager.status().by_specialty.get(&Specialty::Writing), Some(&1));

        // healing twice is a no-op
        let again = manager.self_heal(writer).await.unwrap();
        assert!(again.replacement.is_none());
    }

    #[tokio::test]
    async fn test_create_specialist_queues_when_full() {
        let mut cfg = config();
        cfg.max_execution_agents = 1;
        cfg.pools.insert(Specialty::Research, PoolLimits { min: 0, max: 1 });
        let (manager, _) = start_with(cfg, 1);

        let first = manager.create_specialist(Specialty::Research, Priority::Normal).await.unwrap();
        assert!(matches!(first, SpawnOutcome::Created(_)));
        let queued = manager.create_specialist(Specialty::Research, Priority::Normal).await.unwrap();
        assert_eq!(queued, SpawnOutcome::Queued(0));
        assert_eq!(manager.status().spawn_backlog, 1);

        let burst = manager.create_specialist(Specialty::Research, Priority::Critical).await.unwrap();
        let SpawnOutcome::Created(burst_id) = burst else {
            panic!("critical spawn should burst");
        };
        assert_eq!(manager.agent(burst_id).unwrap().layer, AgentLayer::Execution);

        // shrinking the pool grants the backlog
        let SpawnOutcome::Created(original) = first else { unreachable!() };
        manager.self_heal(original).await.unwrap();
        assert_eq!(manager.status().spawn_backlog, 0);
        // the granted specialist plus the burst agent
        assert_eq!(manager.status().by_specialty.get(&Specialty::Research), Some(&2));
    }

    #[tokio::test]
    async fn test_burst_agents_retire_when_idle() {
        let mut cfg = config();
        cfg.pools.insert(Specialty::Research, PoolLimits { min: 0, max: 0 });
        let (manager, _) = start_with(cfg, 1);
        let outcome = manager.create_specialist(Specialty::Research, Priority::Critical).await.unwrap();
        let SpawnOutcome::Created(id) = outcome else {
            panic!("expected burst agent");
        };
        let retired = manager.retire_idle().await.unwrap();
        assert_eq!(retired, vec![id]);
        assert!(manager.agent(id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_reserved_task_releases_slot() {
        let (manager, _) = start_with(config(), 1);
        let req = request(Specialty::Writing);
        let task_id = req.task_id;
        let assigned = manager.assign_ready(vec![req]).await.unwrap();
        manager.cancel_tasks(vec![task_id]).await.unwrap();
        let record = manager.agent(assigned[&task_id]).unwrap();
        assert!(record.current_tasks.is_empty());
        assert_eq!(record.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_manager_registration() {
        let (manager, _) = start_with(config(), 1);
        let execution_id = Uuid::new_v4();
        let (id, mailbox) = manager.register_manager(execution_id).await.unwrap();
        assert_eq!(mailbox.owner(), id);
        let record = manager.agent(id).unwrap();
        assert_eq!(record.layer, AgentLayer::Management);
        assert_eq!(record.execution_id, Some(execution_id));

        manager.release_manager(id);
        manager.sweep().await.unwrap();
        assert!(manager.agent(id).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let (manager, _) = start_with(config(), 1);
        manager.shutdown().await;
        assert!(manager.sweep().await.is_err());
    }
}
