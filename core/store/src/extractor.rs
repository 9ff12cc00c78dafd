use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use user_memory_schemas::{ContextContribution, InboundMessage};

use crate::database::{ExtractionOutcome, MemoryStore};
use crate::error::Result;
use crate::heuristic::{CandidateFact, FactKind, HeuristicExtractor};

/// What ingesting one message changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub candidates: usize,
    pub outcome: ExtractionOutcome,
    pub context_updated: bool,
}

/// Turns inbound user messages into durable memory: extracted facts become
/// memory entries (and, when accepted, aggregate updates) and tagged
/// messages contribute decisions and action items to their context.
pub struct MessageIngestor {
    store: Arc<MemoryStore>,
    heuristic: HeuristicExtractor,
}

impl MessageIngestor {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            heuristic: HeuristicExtractor::new(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn ingest(&self, message: &InboundMessage) -> Result<IngestReport> {
        let candidates = self.heuristic.extract(&message.content);
        debug!(
            user_id = %message.user_id,
            conversation_id = %message.conversation_id,
            candidates = candidates.len(),
            "Extracted candidate facts"
        );

        let outcome =
            self.store
                .apply_extracted(&message.user_id, &message.conversation_id, &candidates)?;

        let context_updated = match message.context_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {
                self.store.append_to_context(
                    &message.user_id,
                    key,
                    &message.conversation_id,
                    contribution(&candidates),
                )?;
                true
            }
            _ => false,
        };

        if outcome.applied > 0 {
            info!(
                user_id = %message.user_id,
                applied = outcome.applied,
                kept = outcome.kept,
                "Updated memory from message"
            );
        }

        Ok(IngestReport {
            candidates: candidates.len(),
            outcome,
            context_updated,
        })
    }
}

fn contribution(candidates: &[CandidateFact]) -> ContextContribution {
    let mut contribution = ContextContribution::default();
    for fact in candidates {
        match &fact.kind {
            FactKind::Decision(text) => contribution.decisions.push(text.clone()),
            FactKind::ActionItem(text) => contribution.action_items.push(text.clone()),
            FactKind::Project(name) => contribution.key_facts.push(format!("Project: {}", name)),
            FactKind::ClassificationCode(code) => {
                contribution.key_facts.push(format!("Class code: {}", code))
            }
            _ => {}
        }
    }
    contribution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryLimits;
    use tempfile::NamedTempFile;
    use user_memory_schemas::{ConversationId, UserId};

    fn message(content: &str, context_key: Option<&str>) -> InboundMessage {
        InboundMessage {
            user_id: UserId("u_1".into()),
            conversation_id: ConversationId("conv_1".into()),
            content: content.to_string(),
            context_key: context_key.map(str::to_string),
            received_at: "2024-01-10T12:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_tagged_message_contributes_to_context() {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(MemoryStore::open(temp.path(), MemoryLimits::default()).unwrap());
        store.register_user(&UserId("u_1".into())).unwrap();
        let ingestor = MessageIngestor::new(store.clone());

        let report = ingestor
            .ingest(&message(
                "We decided to convert class code 8810 first. TODO: verify NY premiums",
                Some("WC_MIGRATION_2024"),
            ))
            .unwrap();
        assert!(report.context_updated);

        let context = store
            .get_context(&UserId("u_1".into()), "WC_MIGRATION_2024")
            .unwrap()
            .unwrap();
        assert_eq!(
            context.decisions,
            vec!["We decided to convert class code 8810 first".to_string()]
        );
        assert_eq!(context.action_items, vec!["TODO: verify NY premiums".to_string()]);
        assert!(context.key_facts.contains(&"Class code: 8810".to_string()));
    }

    #[test]
    fn test_project_named_two_ways_takes_one_slot() {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(MemoryStore::open(temp.path(), MemoryLimits::default()).unwrap());
        store.register_user(&UserId("u_1".into())).unwrap();
        let ingestor = MessageIngestor::new(store.clone());

        ingestor
            .ingest(&message("I'm working on the Rating Engine project", None))
            .unwrap();

        let memory = store.snapshot(&UserId("u_1".into())).unwrap();
        let names: Vec<&str> = memory
            .active_projects
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["Rating Engine"]);
    }

    #[test]
    fn test_untagged_message_leaves_contexts_alone() {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(MemoryStore::open(temp.path(), MemoryLimits::default()).unwrap());
        store.register_user(&UserId("u_1".into())).unwrap();
        let ingestor = MessageIngestor::new(store.clone());

        let report = ingestor
            .ingest(&message("how are claims reported?", None))
            .unwrap();

        assert!(!report.context_updated);
        assert_eq!(report.outcome.topics, 1);
        assert!(store.list_contexts(&UserId("u_1".into())).unwrap().is_empty());
    }
}
