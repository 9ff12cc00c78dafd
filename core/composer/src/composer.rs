use tracing::{debug, info, warn};
use user_memory_schemas::{
    ContextRequest, ConversationContext, MemoryContext, RenderedSection, SectionKind, UserId,
    UserMemory,
};
use user_memory_store::MemoryStore;

use crate::config::ComposerConfig;
use crate::templates::{TemplateRenderer, HEADER};

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Builds the prompt-grounding block for one user.
pub struct Composer {
    renderer: TemplateRenderer,
}

impl Composer {
    pub fn new(config: &ComposerConfig) -> Self {
        Self {
            renderer: TemplateRenderer::new(config),
        }
    }

    /// Assemble a context from a memory snapshot.
    ///
    /// Sections appear in `SectionKind::PRIORITY` order. When the text would
    /// exceed the budget, whole sections are dropped starting from the lowest
    /// priority. The same inputs always produce the same bytes.
    pub fn build_context(
        &self,
        memory: &UserMemory,
        context: Option<&ConversationContext>,
        request: &ContextRequest,
    ) -> MemoryContext {
        let context = request.context_key.as_ref().and(context);

        let mut sections: Vec<RenderedSection> = SectionKind::PRIORITY
            .iter()
            .filter_map(|&kind| {
                self.renderer
                    .render(kind, memory, context)
                    .map(|text| RenderedSection { kind, text })
            })
            .collect();

        let mut dropped = Vec::new();
        let mut text = join_sections(&sections);
        while estimate_tokens(&text) > request.budget_tokens {
            let Some(section) = sections.pop() else {
                break;
            };
            dropped.push(section.kind);
            text = join_sections(&sections);
        }

        if !dropped.is_empty() {
            debug!(
                budget = request.budget_tokens,
                dropped = dropped.len(),
                "Dropped sections to fit budget"
            );
        }

        MemoryContext {
            token_count: estimate_tokens(&text),
            text,
            sections,
            truncated: !dropped.is_empty(),
            dropped,
            budget_tokens: request.budget_tokens,
        }
    }

    /// Load the user's memory (and the requested context) and assemble.
    /// Read failures degrade to less context, never to an error.
    pub fn compose(
        &self,
        store: &MemoryStore,
        user_id: &UserId,
        request: &ContextRequest,
    ) -> MemoryContext {
        let memory = match store.snapshot(user_id) {
            Ok(memory) => memory,
            Err(e) => {
                warn!(user_id = %user_id, "Failed to load memory, using empty context: {}", e);
                return MemoryContext::empty(request.budget_tokens);
            }
        };

        let context = match request.context_key.as_deref() {
            Some(key) => match store.get_context(user_id, key) {
                Ok(context) => context,
                Err(e) => {
                    warn!(user_id = %user_id, context_key = key, "Failed to load context: {}", e);
                    None
                }
            },
            None => None,
        };

        let assembled = self.build_context(&memory, context.as_ref(), request);
        info!(
            user_id = %user_id,
            sections = assembled.sections.len(),
            tokens = assembled.token_count,
            budget = assembled.budget_tokens,
            truncated = assembled.truncated,
            "Composed memory context"
        );
        assembled
    }
}

fn join_sections(sections: &[RenderedSection]) -> String {
    if sections.is_empty() {
        return String::new();
    }
    let mut parts = vec![HEADER];
    parts.extend(sections.iter().map(|s| s.text.as_str()));
    parts.join("\n\n")
}
