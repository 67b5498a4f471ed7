use crate::config::{OrchestratorConfig, PoolLimits};
use chrono::{DateTime, Utc};
use maestro_core::{AgentLayer, Priority, Specialty};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A request for a new agent that could not be granted immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Pool the agent is wanted for.
    pub specialty: Specialty,
    /// Critical requests jump the queue.
    pub urgency: Priority,
    /// When the request was queued.
    pub requested_at: DateTime<Utc>,
}

/// What to do with a spawn request given the current pool sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnDecision {
    /// Create an agent in the given layer.
    Create(AgentLayer),
    /// The pool is full; wait for it to shrink.
    Queue,
}

/// Enforces pool bounds for agent creation and keeps the backlog of
/// requests waiting for capacity.
///
/// The spawner holds no agents itself. Callers pass current live counts in,
/// which keeps every decision a pure function of the registry snapshot.
#[derive(Debug, Clone)]
pub struct PoolSpawner {
    pools: HashMap<Specialty, PoolLimits>,
    default_pool: PoolLimits,
    /// Cap on execution-layer burst agents across all specialties.
    max_execution_agents: usize,
    backlog: VecDeque<SpawnRequest>,
}

impl PoolSpawner {
    /// Take pool bounds and the burst cap from `config`.
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            pools: config.pools.clone(),
            default_pool: config.default_pool,
            max_execution_agents: config.max_execution_agents,
            backlog: VecDeque::new(),
        }
    }

    /// Bounds for `specialty`, or the default pool.
    pub fn limits(&self, specialty: &Specialty) -> PoolLimits {
        self.pools.get(specialty).copied().unwrap_or(self.default_pool)
    }

    /// Decide whether an agent of `specialty` can be created now.
    ///
    /// `live` counts live specialist-layer agents of the specialty, `burst`
    /// counts live execution-layer agents of any specialty.
    pub fn decide(&self, specialty: &Specialty, urgency: Priority, live: usize, burst: usize) -> SpawnDecision {
        if live < self.limits(specialty).max {
            SpawnDecision::Create(AgentLayer::Specialist)
        } else if urgency == Priority::Critical && burst < self.max_execution_agents {
            SpawnDecision::Create(AgentLayer::Execution)
        } else {
            SpawnDecision::Queue
        }
    }

    /// Queue a request. Critical requests jump ahead of non-critical ones.
    /// Returns the queue position.
    pub fn enqueue(&mut self, specialty: Specialty, urgency: Priority) -> usize {
        let request = SpawnRequest {
            specialty,
            urgency,
            requested_at: Utc::now(),
        };
        let position = if urgency == Priority::Critical {
            self.backlog
                .iter()
                .position(|r| r.urgency != Priority::Critical)
                .unwrap_or(self.backlog.len())
        } else {
            self.backlog.len()
        };
        self.backlog.insert(position, request);
        position
    }

    /// Pop every queued request whose pool now has room, in queue order.
    /// Granted requests count against the pool so one free slot is never
    /// handed out twice.
    pub fn drain_ready(&mut self, live: &HashMap<Specialty, usize>) -> Vec<SpawnRequest> {
        let mut counts = live.clone();
        let mut granted = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.backlog.len());
        while let Some(request) = self.backlog.pop_front() {
            let count = counts.entry(request.specialty.clone()).or_insert(0);
            if *count < self.limits(&request.specialty).max {
                *count += 1;
                granted.push(request);
            } else {
                remaining.push_back(request);
            }
        }
        self.backlog = remaining;
        granted
    }

    /// Agents missing to reach the pool minimum.
    pub fn deficit(&self, specialty: &Specialty, live: usize) -> usize {
        self.limits(specialty).min.saturating_sub(live)
    }

    /// Specialties with a configured minimum above zero.
    pub fn minimums(&self) -> Vec<(Specialty, usize)> {
        let mut mins: Vec<(Specialty, usize)> = self
            .pools
            .iter()
            .filter(|(_, l)| l.min > 0)
            .map(|(s, l)| (s.clone(), l.min))
            .collect();
        mins.sort();
        mins
    }

    /// Whether an idle agent may retire without dropping below the minimum.
    pub fn can_retire(&self, specialty: &Specialty, live: usize) -> bool {
        live > self.limits(specialty).min
    }

    /// Requests waiting for capacity.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Requests waiting for capacity in one specialty.
    pub fn backlog_for(&self, specialty: &Specialty) -> usize {
        self.backlog.iter().filter(|r| &r.specialty == specialty).count()
    }
}
