use std::env;
use user_memory_store::{MemoryError, Result};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:21955";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerConfig {
    pub bind_addr: String,
    /// Conversation summaries rendered into the context.
    pub summary_count: usize,
    /// Items shown per list of a conversation context.
    pub context_item_count: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            summary_count: 5,
            context_item_count: 5,
        }
    }
}

impl ComposerConfig {
    /// Reads `COMPOSER_BIND_ADDR`, `CONTEXT_SUMMARY_COUNT` and
    /// `CONTEXT_ITEM_COUNT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let count = |name: &str, default: usize| -> Result<usize> {
            let Some(raw) = lookup(name) else {
                return Ok(default);
            };
            match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => Ok(value),
                _ => Err(MemoryError::validation(format!(
                    "{} must be a positive integer, got {:?}",
                    name, raw
                ))),
            }
        };

        Ok(Self {
            bind_addr: lookup("COMPOSER_BIND_ADDR").unwrap_or(defaults.bind_addr),
            summary_count: count("CONTEXT_SUMMARY_COUNT", defaults.summary_count)?,
            context_item_count: count("CONTEXT_ITEM_COUNT", defaults.context_item_count)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ComposerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ComposerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = ComposerConfig::from_lookup(lookup(&[
            ("CONTEXT_SUMMARY_COUNT", "10"),
            ("COMPOSER_BIND_ADDR", "0.0.0.0:9000"),
        ]))
        .unwrap();
        assert_eq!(config.summary_count, 10);
        assert_eq!(config.context_item_count, 5);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!(ComposerConfig::from_lookup(lookup(&[("CONTEXT_SUMMARY_COUNT", "0")])).is_err());
        assert!(ComposerConfig::from_lookup(lookup(&[("CONTEXT_ITEM_COUNT", "many")])).is_err());
    }
}
