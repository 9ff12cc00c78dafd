//! Store configuration loaded from environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{MemoryError, Result};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:21953";

/// Capacity bounds for every bounded list the store maintains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub max_active_projects: usize,
    pub max_project_history: usize,
    pub max_conversation_summaries: usize,
    pub max_frequent_topics: usize,
    /// Per user, across all categories.
    pub max_memory_entries: usize,
    /// Per list (facts, decisions, action items) of a conversation context.
    pub max_context_items: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_active_projects: 20,
            max_project_history: 50,
            max_conversation_summaries: 50,
            max_frequent_topics: 20,
            max_memory_entries: 1000,
            max_context_items: 100,
        }
    }
}

impl MemoryLimits {
    /// Every cap must be at least one.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.named() {
            if value == 0 {
                return Err(MemoryError::validation(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Load from `MEMORY_MAX_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |name: &str, default: usize| -> Result<usize> {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => {
                    let value: i64 = raw.trim().parse().map_err(|_| {
                        MemoryError::validation(format!("{} is not an integer: {:?}", name, raw))
                    })?;
                    if value <= 0 {
                        return Err(MemoryError::validation(format!(
                            "{} must be greater than zero, got {}",
                            name, value
                        )));
                    }
                    usize::try_from(value)
                        .map_err(|_| MemoryError::validation(format!("{} is too large", name)))
                }
            }
        };

        let limits = Self {
            max_active_projects: read("MEMORY_MAX_ACTIVE_PROJECTS", defaults.max_active_projects)?,
            max_project_history: read("MEMORY_MAX_PROJECT_HISTORY", defaults.max_project_history)?,
            max_conversation_summaries: read(
                "MEMORY_MAX_CONVERSATION_SUMMARIES",
                defaults.max_conversation_summaries,
            )?,
            max_frequent_topics: read("MEMORY_MAX_FREQUENT_TOPICS", defaults.max_frequent_topics)?,
            max_memory_entries: read("MEMORY_MAX_ENTRIES", defaults.max_memory_entries)?,
            max_context_items: read("MEMORY_MAX_CONTEXT_ITEMS", defaults.max_context_items)?,
        };
        limits.validate()?;
        Ok(limits)
    }

    fn named(&self) -> [(&'static str, usize); 6] {
        [
            ("max_active_projects", self.max_active_projects),
            ("max_project_history", self.max_project_history),
            ("max_conversation_summaries", self.max_conversation_summaries),
            ("max_frequent_topics", self.max_frequent_topics),
            ("max_memory_entries", self.max_memory_entries),
            ("max_context_items", self.max_context_items),
        ]
    }
}

/// Runtime configuration for the store service.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub bind_addr: String,
    /// When set, every non-health request must carry `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
    pub limits: MemoryLimits,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        let db_path = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_db_path());
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let api_key = env::var("MEMORY_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            db_path,
            bind_addr,
            api_key,
            limits: MemoryLimits::from_env()?,
        })
    }
}

/// `$HOME/.user-memory/memory.db`, or `./memory.db` without a home directory.
pub fn default_db_path() -> PathBuf {
    match env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".user-memory").join("memory.db"),
        Err(_) => PathBuf::from("memory.db"),
    }
}
