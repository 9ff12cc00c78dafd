//! In-memory mutations of the `UserMemory` aggregate.
//!
//! Every function here is pure: the caller loads the aggregate, applies one or
//! more mutations and persists the result inside a single transaction.

use user_memory_schemas::{
    ActiveProject, CompletedProject, ConversationSummary, ProjectStatus, ProjectUpdate,
    TopicCounter, UserMemory,
};

use crate::config::MemoryLimits;
use crate::error::{MemoryError, Result};

/// Appends `item` and evicts from the front until `items.len() <= cap`.
/// Returns the evicted items, oldest first.
pub fn push_bounded<T>(items: &mut Vec<T>, item: T, cap: usize) -> Vec<T> {
    items.push(item);
    let overflow = items.len().saturating_sub(cap);
    items.drain(..overflow).collect()
}

/// What `apply_project` did with the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectChange {
    Added,
    Updated,
    /// Went straight to (or was moved into) history.
    Completed,
}

/// Adds or touches an active project.
///
/// A case-insensitive name match updates the project in place and moves it
/// to the most-recently-touched end. A new project at capacity evicts the
/// least-recently-touched one into history with status `done`.
pub fn apply_project(
    memory: &mut UserMemory,
    update: &ProjectUpdate,
    now: &str,
    limits: &MemoryLimits,
) -> Result<ProjectChange> {
    let name = update.name.trim();
    if name.is_empty() {
        return Err(MemoryError::validation("project name must not be empty"));
    }

    let existing = memory
        .active_projects
        .iter()
        .position(|p| p.matches_name(name));

    let (project, change) = match existing {
        Some(index) => {
            let mut project = memory.active_projects.remove(index);
            if let Some(status) = update.status {
                project.status = status;
            }
            if update.description.is_some() {
                project.description = update.description.clone();
            }
            project.last_touched = now.to_string();
            (project, ProjectChange::Updated)
        }
        None => (
            ActiveProject {
                name: name.to_string(),
                status: update.status.unwrap_or(ProjectStatus::InProgress),
                description: update.description.clone(),
                last_touched: now.to_string(),
            },
            ProjectChange::Added,
        ),
    };

    if project.status.is_terminal() {
        archive_project(memory, project, None, now, limits);
        return Ok(ProjectChange::Completed);
    }

    let evicted = push_bounded(
        &mut memory.active_projects,
        project,
        limits.max_active_projects,
    );
    for project in evicted {
        archive_project(memory, project, None, now, limits);
    }
    Ok(change)
}

/// Moves an active project into history. NotFound if it is not active.
pub fn complete_project(
    memory: &mut UserMemory,
    name: &str,
    outcome: Option<String>,
    now: &str,
    limits: &MemoryLimits,
) -> Result<()> {
    let index = memory
        .active_projects
        .iter()
        .position(|p| p.matches_name(name))
        .ok_or_else(|| MemoryError::NotFound(format!("active project {:?}", name.trim())))?;
    let project = memory.active_projects.remove(index);
    archive_project(memory, project, outcome, now, limits);
    Ok(())
}

fn archive_project(
    memory: &mut UserMemory,
    project: ActiveProject,
    outcome: Option<String>,
    now: &str,
    limits: &MemoryLimits,
) {
    let completed = CompletedProject {
        name: project.name,
        status: ProjectStatus::Done,
        description: project.description,
        outcome,
        completed_at: now.to_string(),
    };
    push_bounded(
        &mut memory.project_history,
        completed,
        limits.max_project_history,
    );
}

pub fn add_summary(
    memory: &mut UserMemory,
    topic: &str,
    resolution: &str,
    now: &str,
    limits: &MemoryLimits,
) -> Result<()> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(MemoryError::validation("summary topic must not be empty"));
    }
    push_bounded(
        &mut memory.conversation_summaries,
        ConversationSummary {
            topic: topic.to_string(),
            resolution: resolution.trim().to_string(),
            timestamp: now.to_string(),
        },
        limits.max_conversation_summaries,
    );
    Ok(())
}

/// Increments the counter for `topic`, registering it if new. New topics at
/// capacity evict the least-frequent counter (oldest on ties).
pub fn bump_topic(
    memory: &mut UserMemory,
    topic: &str,
    now: &str,
    limits: &MemoryLimits,
) -> Result<u64> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(MemoryError::validation("topic must not be empty"));
    }

    if let Some(counter) = memory
        .frequent_topics
        .iter_mut()
        .find(|c| c.topic.eq_ignore_ascii_case(topic))
    {
        counter.count += 1;
        return Ok(counter.count);
    }

    while memory.frequent_topics.len() >= limits.max_frequent_topics {
        let weakest = memory
            .frequent_topics
            .iter()
            .enumerate()
            .min_by_key(|(index, c)| (c.count, *index))
            .map(|(index, _)| index);
        match weakest {
            Some(index) => {
                memory.frequent_topics.remove(index);
            }
            None => break,
        }
    }

    memory.frequent_topics.push(TopicCounter {
        topic: topic.to_string(),
        count: 1,
        first_seen: now.to_string(),
    });
    Ok(1)
}

pub fn record_message(memory: &mut UserMemory, now: &str) {
    memory.stats.total_messages += 1;
    memory.stats.last_interaction = Some(now.to_string());
}

pub fn record_conversation(memory: &mut UserMemory, now: &str) {
    memory.stats.total_conversations += 1;
    memory.stats.last_interaction = Some(now.to_string());
}
