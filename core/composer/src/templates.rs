use chrono::DateTime;
use user_memory_schemas::{ConversationContext, SectionKind, UserMemory};

use crate::config::ComposerConfig;

pub const HEADER: &str = "PERSISTENT MEMORY";

/// Renders one section at a time. An empty result means the section has
/// nothing to say and is left out of the context.
pub struct TemplateRenderer {
    summary_count: usize,
    context_item_count: usize,
}

impl TemplateRenderer {
    pub fn new(config: &ComposerConfig) -> Self {
        Self {
            summary_count: config.summary_count,
            context_item_count: config.context_item_count,
        }
    }

    pub fn render(
        &self,
        kind: SectionKind,
        memory: &UserMemory,
        context: Option<&ConversationContext>,
    ) -> Option<String> {
        let lines = match kind {
            SectionKind::Identity => self.render_identity(memory),
            SectionKind::Team => self.render_team(memory),
            SectionKind::ActiveProjects => self.render_projects(memory),
            SectionKind::DomainExpertise => self.render_expertise(memory),
            SectionKind::ConversationContext => match context {
                Some(context) => self.render_context(context),
                None => Vec::new(),
            },
            SectionKind::ConversationSummaries => self.render_summaries(memory),
        };

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    fn render_identity(&self, memory: &UserMemory) -> Vec<String> {
        let mut lines: Vec<String> = memory
            .employee_facts
            .pairs()
            .iter()
            .map(|(key, value)| format!("- {}: {}", label(key), value))
            .collect();

        if let Some(notes) = memory.custom_notes.as_deref() {
            if !notes.trim().is_empty() {
                lines.push(format!("- Notes: {}", notes.trim()));
            }
        }

        with_title("EMPLOYEE PROFILE:", lines)
    }

    fn render_team(&self, memory: &UserMemory) -> Vec<String> {
        let lines = memory
            .team_info
            .pairs()
            .iter()
            .map(|(key, value)| format!("- {}: {}", label(key), value))
            .collect();
        with_title("TEAM INFORMATION:", lines)
    }

    /// Most recently touched first.
    fn render_projects(&self, memory: &UserMemory) -> Vec<String> {
        let mut lines = Vec::new();
        for project in memory.active_projects.iter().rev() {
            lines.push(format!(
                "- {} (status: {})",
                project.name,
                project.status.as_str()
            ));
            if let Some(description) = project.description.as_deref() {
                if !description.trim().is_empty() {
                    lines.push(format!("  {}", description.trim()));
                }
            }
        }
        with_title("ACTIVE PROJECTS:", lines)
    }

    fn render_expertise(&self, memory: &UserMemory) -> Vec<String> {
        let mut lines = Vec::new();
        for (set_name, tags) in &memory.domain_expertise.0 {
            if tags.is_empty() {
                continue;
            }
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            lines.push(format!("- {}: {}", label(set_name), tags.join(", ")));
        }

        for (key, value) in &memory.tech_preferences {
            lines.push(format!("- Prefers ({}): {}", key, value));
        }

        if !memory.frequent_topics.is_empty() {
            let topics: Vec<String> = memory
                .frequent_topics
                .iter()
                .map(|t| format!("{} ({})", t.topic, t.count))
                .collect();
            lines.push(format!("- Frequent Topics: {}", topics.join(", ")));
        }

        with_title("DOMAIN EXPERTISE:", lines)
    }

    fn render_context(&self, context: &ConversationContext) -> Vec<String> {
        if !context.has_content() {
            return Vec::new();
        }

        let mut lines = vec![format!(
            "CONTEXT: {} [{}]",
            context.title, context.context_key
        )];
        let groups = [
            ("Key Facts:", &context.key_facts),
            ("Decisions Made:", &context.decisions),
            ("Action Items:", &context.action_items),
        ];
        for (title, items) in groups {
            if items.is_empty() {
                continue;
            }
            lines.push(format!("  {}", title));
            for item in last_n(items, self.context_item_count) {
                lines.push(format!("  - {}", item));
            }
        }
        lines
    }

    /// The most recent summaries, newest first.
    fn render_summaries(&self, memory: &UserMemory) -> Vec<String> {
        let mut lines = Vec::new();
        for summary in memory
            .conversation_summaries
            .iter()
            .rev()
            .take(self.summary_count)
        {
            lines.push(format!(
                "- [{}] {}",
                format_date(&summary.timestamp),
                summary.topic
            ));
            if !summary.resolution.trim().is_empty() {
                lines.push(format!("  -> {}", summary.resolution.trim()));
            }
        }
        with_title("RECENT CONVERSATIONS:", lines)
    }
}

fn with_title(title: &str, lines: Vec<String>) -> Vec<String> {
    if lines.is_empty() {
        return lines;
    }
    let mut section = Vec::with_capacity(lines.len() + 1);
    section.push(title.to_string());
    section.extend(lines);
    section
}

fn last_n(items: &[String], n: usize) -> &[String] {
    &items[items.len().saturating_sub(n)..]
}

/// `full_name` -> `Full Name`.
fn label(key: &str) -> String {
    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn format_date(rfc3339: &str) -> String {
    match DateTime::parse_from_rfc3339(rfc3339) {
        Ok(dt) => dt.format("%Y-%m-%d").to_string(),
        Err(_) => rfc3339.to_string(),
    }
}
