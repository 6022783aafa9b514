//! Running record of agent progress that feeds handoff snapshots.

use crate::handoff::{HandoffSnapshot, ToolResultDigest, MAX_KEY_FACTS, MAX_TOOL_RESULTS};
use std::collections::VecDeque;

/// Tracks an agent's working state across turns so a [`HandoffSnapshot`] can
/// be produced whenever the failover engine may need one.
///
/// Facts and tool results are kept in bounded ring buffers (a little larger
/// than what a snapshot retains); tasks stay in insertion order until
/// completed.
pub struct TaskContext {
    objective: String,
    progress: String,
    facts: VecDeque<String>,
    tasks: Vec<String>,
    last_success: String,
    last_attempt: String,
    tool_results: VecDeque<ToolResultDigest>,
    max_history: usize,
}

impl TaskContext {
    /// Start tracking work towards `objective`.
    pub fn new(objective: impl Into<String>) -> Self {
        Self::with_history(objective, MAX_KEY_FACTS.max(MAX_TOOL_RESULTS) * 2)
    }

    /// `max_history` bounds the retained facts and tool results.
    pub fn with_history(objective: impl Into<String>, max_history: usize) -> Self {
        Self {
            objective: objective.into(),
            progress: String::new(),
            facts: VecDeque::new(),
            tasks: Vec::new(),
            last_success: String::new(),
            last_attempt: String::new(),
            tool_results: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    /// Current objective.
    pub fn objective(&self) -> &str {
        &self.objective
    }

    /// Replace the objective.
    pub fn set_objective(&mut self, objective: impl Into<String>) {
        self.objective = objective.into();
    }

    /// Replace the progress summary.
    pub fn set_progress(&mut self, progress: impl Into<String>) {
        self.progress = progress.into();
    }

    /// Record a fact; exact duplicates are ignored.
    pub fn add_fact(&mut self, fact: impl Into<String>) {
        let fact = fact.into();
        if self.facts.contains(&fact) {
            return;
        }
        self.facts.push_back(fact);
        while self.facts.len() > self.max_history {
            self.facts.pop_front();
        }
    }

    /// Add an open task; duplicates are ignored.
    pub fn add_task(&mut self, task: impl Into<String>) {
        let task = task.into();
        if !self.tasks.contains(&task) {
            self.tasks.push(task);
        }
    }

    /// Remove `task` from the open list. Returns `false` if it was not open.
    pub fn complete_task(&mut self, task: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t != task);
        self.tasks.len() != before
    }

    /// Open tasks in insertion order.
    pub fn open_tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Mark the start of an action; it stays "last attempted" until the next.
    pub fn begin_step(&mut self, action: impl Into<String>) {
        self.last_attempt = action.into();
    }

    /// Mark the last attempted action as having succeeded.
    pub fn complete_step(&mut self) {
        self.last_success = self.last_attempt.clone();
    }

    /// Remember the output of a tool call.
    pub fn record_tool_result(&mut self, tool: impl Into<String>, result: impl Into<String>) {
        self.tool_results.push_back(ToolResultDigest::new(tool, result));
        while self.tool_results.len() > self.max_history {
            self.tool_results.pop_front();
        }
    }

    /// Build a bounded snapshot of the current state.
    pub fn snapshot(&self) -> HandoffSnapshot {
        HandoffSnapshot::build(
            self.objective.clone(),
            self.progress.clone(),
            self.facts.iter().cloned().collect(),
            self.tasks.clone(),
            self.last_success.clone(),
            self.last_attempt.clone(),
            self.tool_results.iter().cloned().collect(),
        )
    }

    /// Forget everything except the objective.
    pub fn clear(&mut self) {
        self.progress.clear();
        self.facts.clear();
        self.tasks.clear();
        self.last_success.clear();
        self.last_attempt.clear();
        self.tool_results.clear();
    }
}
