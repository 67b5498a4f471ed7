//! Agent actors.
//!
//! Every specialist or execution-layer agent is an independent tokio task
//! with its own command channel, priority inbox and bus mailbox. The actor
//! runs at most `max_tasks` sub-tasks at once, publishes a heartbeat on a
//! fixed interval and reports each finished attempt to the hierarchy.

use crate::bus::{CommunicationBus, Mailbox, MessageKind};
use maestro_core::{
    AgentId, AgentLayer, MaestroError, MaestroResult, Priority, SpecialistHandler, SpecialistInput,
    SpecialistOutput, Specialty, TaskContext,
};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One attempt of a sub-task, as handed to an agent.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    /// Workflow the sub-task belongs to.
    pub execution_id: Uuid,
    /// Sub-task being attempted.
    pub task_id: Uuid,
    /// Specialty the attempt needs.
    pub specialty: Specialty,
    /// Effective priority: the higher of task and workflow priority.
    pub priority: Priority,
    /// What the specialist works on.
    pub input: SpecialistInput,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Child of the workflow token.
    pub cancel: CancellationToken,
    /// Budget for the attempt; exceeding it is a transient failure.
    pub timeout: Duration,
}

/// Instructions from the hierarchy to one agent.
#[derive(Debug)]
pub enum AgentCommand {
    /// Run one attempt.
    Execute(TaskEnvelope),
    /// Abort the attempt for this sub-task, if running.
    Cancel(Uuid),
    /// Finish the current attempt and exit.
    Stop,
}

/// Report of one finished attempt.
#[derive(Debug)]
pub struct TaskFinished {
    /// Agent that ran the attempt.
    pub agent_id: AgentId,
    /// Sub-task the attempt belongs to.
    pub task_id: Uuid,
    /// Attempt number, matched against the current flight.
    pub attempt: u32,
    /// What the specialist returned.
    pub result: MaestroResult<SpecialistOutput>,
    /// Wall time spent on the attempt.
    pub duration_ms: u64,
}

/// Progress reports from agents back to the hierarchy.
#[derive(Debug)]
pub enum AgentEvent {
    /// An attempt began running.
    Started {
        /// Agent running it.
        agent_id: AgentId,
        /// Sub-task being attempted.
        task_id: Uuid,
    },
    /// An attempt ended, successfully or not.
    Finished(TaskFinished),
}

/// Static parameters of an agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Registry id.
    pub id: AgentId,
    /// Layer the agent lives in.
    pub layer: AgentLayer,
    /// Specialty the agent serves.
    pub specialty: Specialty,
    /// Concurrent attempts the agent accepts.
    pub max_tasks: usize,
    /// How often the agent proves it is alive.
    pub heartbeat_interval: Duration,
}

/// Owner-side handle of a running agent.
#[derive(Debug)]
pub struct AgentHandle {
    /// Registry id.
    pub id: AgentId,
    /// Layer the agent lives in.
    pub layer: AgentLayer,
    /// Specialty the agent serves.
    pub specialty: Specialty,
    tx: mpsc::UnboundedSender<AgentCommand>,
    /// Milliseconds since `epoch` at the last heartbeat.
    heartbeat: Arc<AtomicU64>,
    epoch: Instant,
    kill: CancellationToken,
    join: JoinHandle<()>,
}

impl AgentHandle {
    /// Queue a command. Fails once the agent has exited.
    pub fn send(&self, command: AgentCommand) -> MaestroResult<()> {
        self.tx
            .send(command)
            .map_err(|_| MaestroError::AgentFailure(self.id))
    }

    /// Time since the agent last proved it was alive.
    pub fn heartbeat_age(&self) -> Duration {
        let last = Duration::from_millis(self.heartbeat.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Crash the agent: heartbeats stop and running work vanishes without
    /// a report, exactly as if the process had died.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Ask the agent to stop after cancelling whatever it runs.
    pub fn stop(&self) {
        let _ = self.tx.send(AgentCommand::Stop);
    }

    /// Whether the agent task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

struct Queued {
    priority: Priority,
    seq: u64,
    envelope: TaskEnvelope,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    /// Higher priority first, then arrival order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Worker {
    spec: AgentSpec,
    handler: Arc<dyn SpecialistHandler>,
    bus: CommunicationBus,
    events: mpsc::UnboundedSender<AgentEvent>,
    heartbeat: Arc<AtomicU64>,
    epoch: Instant,
    kill: CancellationToken,
    inbox: BinaryHeap<Queued>,
    seq: u64,
    running: JoinSet<TaskFinished>,
    /// Local cancellation per running task, children of the envelope token.
    tokens: HashMap<Uuid, CancellationToken>,
    helping: JoinSet<()>,
}

/// Start an agent actor and register its mailbox on the bus.
pub fn spawn_agent(
    spec: AgentSpec,
    handler: Arc<dyn SpecialistHandler>,
    bus: CommunicationBus,
    events: mpsc::UnboundedSender<AgentEvent>,
    epoch: Instant,
) -> AgentHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let mailbox = bus.register(spec.id);
    let heartbeat = Arc::new(AtomicU64::new(millis_since(epoch)));
    let kill = CancellationToken::new();

    let worker = Worker {
        spec: spec.clone(),
        handler,
        bus,
        events,
        heartbeat: Arc::clone(&heartbeat),
        epoch,
        kill: kill.clone(),
        inbox: BinaryHeap::new(),
        seq: 0,
        running: JoinSet::new(),
        tokens: HashMap::new(),
        helping: JoinSet::new(),
    };
    let join = tokio::spawn(worker.run(rx, mailbox));
    info!(agent_id = %spec.id, layer = %spec.layer, specialty = %spec.specialty, "Agent started");

    AgentHandle {
        id: spec.id,
        layer: spec.layer,
        specialty: spec.specialty,
        tx,
        heartbeat,
        epoch,
        kill,
        join,
    }
}

fn millis_since(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentCommand>, mut mailbox: Mailbox) {
        let mut ticker = tokio::time::interval(self.spec.heartbeat_interval);
        let mut mailbox_open = true;
        let kill = self.kill.clone();

        loop {
            self.start_queued();
            tokio::select! {
                biased;
                _ = kill.cancelled() => {
                    warn!(agent_id = %self.spec.id, "Agent killed");
                    self.abandon();
                    return;
                }
                _ = ticker.tick() => {
                    self.heartbeat.store(millis_since(self.epoch), Ordering::Relaxed);
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    if let Ok(finished) = joined {
                        self.tokens.remove(&finished.task_id);
                        let _ = self.events.send(AgentEvent::Finished(finished));
                    }
                }
                command = rx.recv() => match command {
                    Some(AgentCommand::Execute(envelope)) => self.enqueue(envelope),
                    Some(AgentCommand::Cancel(task_id)) => self.cancel(task_id),
                    Some(AgentCommand::Stop) | None => {
                        debug!(agent_id = %self.spec.id, "Agent stopping");
                        self.abandon();
                        return;
                    }
                },
                message = mailbox.recv(), if mailbox_open => match message {
                    Some(msg) => self.on_message(msg.kind),
                    None => mailbox_open = false,
                },
                Some(_) = self.helping.join_next(), if !self.helping.is_empty() => {}
            }
        }
    }

    fn enqueue(&mut self, envelope: TaskEnvelope) {
        self.seq += 1;
        self.inbox.push(Queued {
            priority: envelope.priority,
            seq: self.seq,
            envelope,
        });
    }

    fn start_queued(&mut self) {
        while self.running.len() < self.spec.max_tasks {
            let Some(Queued { envelope, .. }) = self.inbox.pop() else {
                break;
            };
            let task_id = envelope.task_id;
            let local = envelope.cancel.child_token();
            self.tokens.insert(task_id, local.clone());
            let _ = self.events.send(AgentEvent::Started {
                agent_id: self.spec.id,
                task_id,
            });
            let handler = Arc::clone(&self.handler);
            let agent_id = self.spec.id;
            self.running.spawn(async move {
                let attempt = envelope.attempt;
                // run in its own task so a panicking handler still yields a report
                let inner = tokio::spawn(execute(handler, envelope, local, agent_id));
                match inner.await {
                    Ok(finished) => finished,
                    Err(e) => TaskFinished {
                        agent_id,
                        task_id,
                        attempt,
                        result: Err(MaestroError::permanent(format!("specialist crashed: {e}"))),
                        duration_ms: 0,
                    },
                }
            });
        }
    }

    fn cancel(&mut self, task_id: Uuid) {
        if let Some(token) = self.tokens.get(&task_id) {
            token.cancel();
            return;
        }
        let before = self.inbox.len();
        let mut kept = BinaryHeap::with_capacity(before);
        for queued in self.inbox.drain() {
            if queued.envelope.task_id == task_id {
                let _ = self.events.send(AgentEvent::Finished(TaskFinished {
                    agent_id: self.spec.id,
                    task_id,
                    attempt: queued.envelope.attempt,
                    result: Err(MaestroError::Cancelled(format!("task {task_id}"))),
                    duration_ms: 0,
                }));
            } else {
                kept.push(queued);
            }
        }
        self.inbox = kept;
    }

    fn on_message(&mut self, kind: MessageKind) {
        match kind {
            MessageKind::HelpRequest {
                request_id,
                specialty,
                context,
            } => {
                let handler = Arc::clone(&self.handler);
                let bus = self.bus.clone();
                let agent_id = self.spec.id;
                let cancel = self.kill.child_token();
                self.helping.spawn(async move {
                    let ctx = TaskContext::new(request_id, specialty, 1, cancel);
                    let input = SpecialistInput {
                        description: "Help request".to_string(),
                        context,
                        ..Default::default()
                    };
                    match handler.execute(&ctx, input).await {
                        Ok(output) => {
                            if let Err(e) = bus.respond_help(agent_id, request_id, output.payload).await {
                                warn!(agent_id = %agent_id, request_id = %request_id, error = %e, "Help response undeliverable");
                            }
                        }
                        Err(e) => {
                            warn!(agent_id = %agent_id, request_id = %request_id, error = %e, "Help request failed");
                            bus.fail_help(request_id);
                        }
                    }
                });
            }
            other => {
                debug!(agent_id = %self.spec.id, kind = other.name(), "Message received");
            }
        }
    }

    /// Drop all work without reporting it.
    fn abandon(&mut self) {
        for token in self.tokens.values() {
            token.cancel();
        }
        self.running.abort_all();
        self.helping.abort_all();
        self.inbox.clear();
        self.bus.unregister(self.spec.id);
    }
}

async fn execute(
    handler: Arc<dyn SpecialistHandler>,
    envelope: TaskEnvelope,
    cancel: CancellationToken,
    agent_id: AgentId,
) -> TaskFinished {
    let started = Instant::now();
    let task_id = envelope.task_id;
    let ctx = TaskContext::new(task_id, envelope.specialty, envelope.attempt, cancel.clone());
    let limit = envelope.timeout;

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(MaestroError::Cancelled(format!("task {task_id}"))),
        outcome = tokio::time::timeout(limit, handler.execute(&ctx, envelope.input)) => match outcome {
            Ok(result) => result,
            Err(_) => Err(MaestroError::Timeout(format!(
                "task {task_id} exceeded {}ms",
                limit.as_millis()
            ))),
        },
    };

    TaskFinished {
        agent_id,
        task_id,
        attempt: envelope.attempt,
        result,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}
