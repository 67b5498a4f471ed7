use crate::graph::TaskGraph;
use crate::types::{SubTask, SubTaskStatus};
use chrono::Utc;
use maestro_core::{AgentId, MaestroError, MaestroResult};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The mutable sub-task set of one workflow, with dependency resolution.
///
/// This is the only place sub-task status changes, so the running-after-
/// dependencies rule is enforced here.
pub struct TaskQueue {
    tasks: HashMap<Uuid, SubTask>,
    /// Insertion order, which is topological for decomposed plans.
    order: Vec<Uuid>,
    completed: HashSet<Uuid>,
}

impl TaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            completed: HashSet::new(),
        }
    }

    /// Queue the sub-tasks of a plan in plan order.
    pub fn from_subtasks(subtasks: Vec<SubTask>) -> Self {
        let mut queue = Self::new();
        for task in subtasks {
            queue.add(task);
        }
        queue
    }

    /// Add a sub-task to the queue.
    pub fn add(&mut self, task: SubTask) -> Uuid {
        let id = task.id;
        if task.status == SubTaskStatus::Completed {
            self.completed.insert(id);
        }
        if self.tasks.insert(id, task).is_none() {
            self.order.push(id);
        }
        id
    }

    /// All sub-tasks ready to run: pending with every dependency completed.
    /// Higher priority first, then insertion order.
    pub fn all_ready(&self) -> Vec<&SubTask> {
        let mut ready: Vec<(usize, &SubTask)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(i, id)| self.tasks.get(id).map(|t| (i, t)))
            .filter(|(_, t)| t.is_ready(&self.completed))
            .collect();
        ready.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        ready.into_iter().map(|(_, t)| t).collect()
    }

    /// Highest-priority ready sub-task.
    pub fn next_ready(&self) -> Option<&SubTask> {
        self.all_ready().into_iter().next()
    }

    /// Move a sub-task to running. Fails unless it is pending and every
    /// dependency has completed.
    pub fn mark_running(&mut self, id: Uuid) -> MaestroResult<()> {
        let task = self
            .tasks
            .get(&id)
            .ok_or_else(|| MaestroError::NotFound(format!("sub-task {id}")))?;
        if task.status != SubTaskStatus::Pending {
            return Err(MaestroError::permanent(format!(
                "sub-task {id} cannot start from status {:?}",
                task.status
            )));
        }
        if let Some(dep) = task.dependencies.iter().find(|d| !self.completed.contains(d)) {
            return Err(MaestroError::permanent(format!(
                "sub-task {id} cannot start before dependency {dep} completes"
            )));
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = SubTaskStatus::Running;
            task.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record the agent holding a sub-task.
    pub fn assign(&mut self, id: Uuid, agent: AgentId) -> bool {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.assigned_agent = Some(agent);
            true
        } else {
            false
        }
    }

    /// Record a passing result. Returns `false` for unknown ids.
    pub fn mark_completed(&mut self, id: Uuid, result: serde_json::Value, score: f64) -> bool {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = SubTaskStatus::Completed;
            task.result = Some(result);
            task.quality_score = Some(score);
            task.completed_at = Some(Utc::now());
            self.completed.insert(id);
            true
        } else {
            false
        }
    }

    /// Mark a sub-task failed, keeping whatever partial result it produced.
    pub fn mark_failed(&mut self, id: Uuid, reason: String, partial: Option<(serde_json::Value, f64)>) -> bool {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = SubTaskStatus::Failed;
            task.failure_reason = Some(reason);
            task.completed_at = Some(Utc::now());
            if let Some((payload, score)) = partial {
                task.result = Some(payload);
                task.quality_score = Some(score);
            }
            true
        } else {
            false
        }
    }

    /// Fail every pending sub-task downstream of `id`, which can no longer
    /// have its dependencies met. Returns them in topological order.
    pub fn block_downstream(&mut self, id: Uuid) -> Vec<Uuid> {
        let Ok(graph) = TaskGraph::build(&self.snapshot()) else {
            return Vec::new();
        };
        let blocked: Vec<Uuid> = graph
            .downstream_of(id)
            .into_iter()
            .filter(|d| {
                self.tasks
                    .get(d)
                    .is_some_and(|t| t.status == SubTaskStatus::Pending)
            })
            .collect();
        for task_id in &blocked {
            self.mark_failed(*task_id, format!("blocked by failed upstream sub-task {id}"), None);
        }
        blocked
    }

    /// Look up a sub-task.
    pub fn get(&self, id: Uuid) -> Option<&SubTask> {
        self.tasks.get(&id)
    }

    /// Look up a sub-task for in-place updates.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut SubTask> {
        self.tasks.get_mut(&id)
    }

    /// All sub-tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&SubTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    /// Owned copies of every sub-task in insertion order.
    pub fn snapshot(&self) -> Vec<SubTask> {
        self.all_tasks().into_iter().cloned().collect()
    }

    /// Results of the completed dependencies of a sub-task.
    pub fn upstream_results(&self, id: Uuid) -> HashMap<Uuid, serde_json::Value> {
        let Some(task) = self.tasks.get(&id) else {
            return HashMap::new();
        };
        task.dependencies
            .iter()
            .filter_map(|dep| {
                self.tasks
                    .get(dep)
                    .and_then(|t| t.result.clone())
                    .map(|r| (*dep, r))
            })
            .collect()
    }

    /// Number of sub-tasks in `status`.
    pub fn count(&self, status: SubTaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Number of sub-tasks not yet started.
    pub fn pending_count(&self) -> usize {
        self.count(SubTaskStatus::Pending)
    }

    /// Ids of running sub-tasks in insertion order.
    pub fn running_ids(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.status == SubTaskStatus::Running)
            })
            .copied()
            .collect()
    }

    /// Number of completed sub-tasks.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Number of sub-tasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Every sub-task is completed or failed.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Every sub-task completed.
    pub fn all_completed(&self) -> bool {
        self.completed.len() == self.tasks.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
