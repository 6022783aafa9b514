//! Continuity context handed to a model that takes over mid-task.
//!
//! When the engine fails over, the new model has not seen the reasoning that
//! produced the conversation so far. A [`HandoffSnapshot`] condenses the
//! agent's working state into a bounded summary which
//! [`inject_into_conversation`] places next to the system prompt.

use prospector_core::Message;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Most-recent facts kept in a snapshot.
pub const MAX_KEY_FACTS: usize = 10;
/// Leading open tasks kept in a snapshot.
pub const MAX_OPEN_TASKS: usize = 5;
/// Most-recent tool results kept in a snapshot.
pub const MAX_TOOL_RESULTS: usize = 5;

/// First line of a rendered handoff block.
pub const HANDOFF_HEADER: &str = "=== CONTEXT HANDOFF ===";
/// Last line of a rendered handoff block.
pub const HANDOFF_FOOTER: &str = "=== END HANDOFF ===";
/// Metadata key set on the injected message.
pub const HANDOFF_METADATA_KEY: &str = "handoff";

/// Output of one tool call, as remembered for a handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultDigest {
    /// Tool name.
    pub tool: String,
    /// Condensed output.
    pub result: String,
}

impl ToolResultDigest {
    /// Digest of one call to `tool`.
    pub fn new(tool: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            result: result.into(),
        }
    }
}

/// Bounded summary of agent progress. Bounds are applied when the snapshot
/// is built, so every instance is already truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotParts")]
pub struct HandoffSnapshot {
    current_objective: String,
    progress_summary: String,
    key_facts: Vec<String>,
    open_tasks: Vec<String>,
    last_successful_step: String,
    last_attempted_action: String,
    recent_tool_results: Vec<ToolResultDigest>,
}

impl HandoffSnapshot {
    /// Build a snapshot, keeping the last [`MAX_KEY_FACTS`] facts, the first
    /// [`MAX_OPEN_TASKS`] tasks and the last [`MAX_TOOL_RESULTS`] tool results.
    pub fn build(
        objective: impl Into<String>,
        progress: impl Into<String>,
        facts: Vec<String>,
        tasks: Vec<String>,
        last_success: impl Into<String>,
        last_attempt: impl Into<String>,
        recent_results: Vec<ToolResultDigest>,
    ) -> Self {
        Self {
            current_objective: objective.into(),
            progress_summary: progress.into(),
            key_facts: keep_last(facts, MAX_KEY_FACTS),
            open_tasks: tasks.into_iter().take(MAX_OPEN_TASKS).collect(),
            last_successful_step: last_success.into(),
            last_attempted_action: last_attempt.into(),
            recent_tool_results: keep_last(recent_results, MAX_TOOL_RESULTS),
        }
    }

    /// What the agent is trying to achieve.
    pub fn current_objective(&self) -> &str {
        &self.current_objective
    }

    /// Free-form progress note.
    pub fn progress_summary(&self) -> &str {
        &self.progress_summary
    }

    /// Retained facts, oldest first.
    pub fn key_facts(&self) -> &[String] {
        &self.key_facts
    }

    /// Retained open tasks.
    pub fn open_tasks(&self) -> &[String] {
        &self.open_tasks
    }

    /// Most recent step that completed.
    pub fn last_successful_step(&self) -> &str {
        &self.last_successful_step
    }

    /// Most recent step started, successful or not.
    pub fn last_attempted_action(&self) -> &str {
        &self.last_attempted_action
    }

    /// Retained tool results, oldest first.
    pub fn recent_tool_results(&self) -> &[ToolResultDigest] {
        &self.recent_tool_results
    }

    /// Render the snapshot into the fixed handoff template.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{HANDOFF_HEADER}");
        let _ = writeln!(
            out,
            "You are continuing a task started by another model. This is injected \
             continuity context, not a user message."
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Current objective: {}", or_none(&self.current_objective));
        let _ = writeln!(out, "Progress so far: {}", or_none(&self.progress_summary));
        let _ = writeln!(out, "Last successful step: {}", or_none(&self.last_successful_step));
        let _ = writeln!(out, "Last attempted action: {}", or_none(&self.last_attempted_action));

        let _ = writeln!(out, "\nKey facts:");
        write_list(&mut out, self.key_facts.iter().map(String::as_str));

        let _ = writeln!(out, "\nOpen tasks:");
        write_list(&mut out, self.open_tasks.iter().map(String::as_str));

        let _ = writeln!(out, "\nRecent tool results:");
        if self.recent_tool_results.is_empty() {
            let _ = writeln!(out, "- (none)");
        }
        for digest in &self.recent_tool_results {
            let _ = writeln!(out, "- [{}] {}", digest.tool, digest.result);
        }

        let _ = write!(out, "{HANDOFF_FOOTER}");
        out
    }
}

/// Unbounded wire form; deserialized snapshots go back through the bounds.
#[derive(Deserialize)]
struct SnapshotParts {
    current_objective: String,
    progress_summary: String,
    #[serde(default)]
    key_facts: Vec<String>,
    #[serde(default)]
    open_tasks: Vec<String>,
    last_successful_step: String,
    last_attempted_action: String,
    #[serde(default)]
    recent_tool_results: Vec<ToolResultDigest>,
}

impl From<SnapshotParts> for HandoffSnapshot {
    fn from(parts: SnapshotParts) -> Self {
        HandoffSnapshot::build(
            parts.current_objective,
            parts.progress_summary,
            parts.key_facts,
            parts.open_tasks,
            parts.last_successful_step,
            parts.last_attempted_action,
            parts.recent_tool_results,
        )
    }
}

/// Free-function form of [`HandoffSnapshot::build`].
pub fn build_snapshot(
    objective: impl Into<String>,
    progress: impl Into<String>,
    facts: Vec<String>,
    tasks: Vec<String>,
    last_success: impl Into<String>,
    last_attempt: impl Into<String>,
    recent_results: Vec<ToolResultDigest>,
) -> HandoffSnapshot {
    HandoffSnapshot::build(
        objective,
        progress,
        facts,
        tasks,
        last_success,
        last_attempt,
        recent_results,
    )
}

/// Return a copy of `messages` with the rendered snapshot inserted right
/// after the first system message, or at the front if there is none.
pub fn inject_into_conversation(messages: &[Message], snapshot: &HandoffSnapshot) -> Vec<Message> {
    let handoff = Message::system(snapshot.render())
        .with_metadata(HANDOFF_METADATA_KEY, serde_json::Value::Bool(true));

    let position = messages
        .iter()
        .position(Message::is_system)
        .map_or(0, |i| i + 1);

    let mut out = Vec::with_capacity(messages.len() + 1);
    out.extend_from_slice(&messages[..position]);
    out.push(handoff);
    out.extend_from_slice(&messages[position..]);
    out
}

/// Whether `message` was produced by [`inject_into_conversation`].
pub fn is_handoff_message(message: &Message) -> bool {
    message
        .metadata
        .get(HANDOFF_METADATA_KEY)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

fn keep_last<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

fn or_none(value: &str) -> &str {
    if value.trim().is_empty() {
        "(none)"
    } else {
        value
    }
}

fn write_list<'a>(out: &mut String, items: impl Iterator<Item = &'a str>) {
    let mut empty = true;
    for item in items {
        empty = false;
        let _ = writeln!(out, "- {item}");
    }
    if empty {
        let _ = writeln!(out, "- (none)");
    }
}
