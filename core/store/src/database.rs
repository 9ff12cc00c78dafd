use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use user_memory_schemas::{
    generate_context_id, generate_entry_id, generate_user_memory_id, ContextContribution,
    ContextId, ContextKind, ContextStatus, ConversationContext, ConversationId, DomainExpertise,
    EmployeeFacts, EntryFilter, EntryId, EntryWrite, InteractionStats, MemoryCategory,
    MemoryEntry, NewMemoryEntry, ProjectStatus, ProjectUpdate, TeamInfo, UserId, UserMemory,
    UserMemoryId, CLASSIFICATION_CODES, EXPLICIT_CONFIDENCE, STATES_WORKED,
};

use crate::aggregate::{self, push_bounded};
use crate::config::MemoryLimits;
use crate::error::{MemoryError, Result};
use crate::heuristic::{project_key, CandidateFact, FactKind};
use crate::locks::{acquire, UserLocks};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONTEXT_KEY_CHARS: usize = 200;

const MEMORY_COLUMNS: &str = "id, user_id, employee_facts, team_info, active_projects,
     project_history, conversation_summaries, domain_expertise, tech_preferences,
     frequent_topics, custom_notes, total_conversations, total_messages, last_interaction,
     created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, user_id, category, key, value, source_conversation_id,
     confidence, tags, metadata, created_at, updated_at";

const CONTEXT_COLUMNS: &str = "id, user_id, context_key, kind, title, description, status,
     conversation_ids, key_facts, decisions, action_items, created_at, updated_at,
     last_contribution_at";

/// Outcome of `record_memory_entry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEntry {
    pub write: EntryWrite,
    pub entry: MemoryEntry,
}

/// Outcome of applying one message's extracted facts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    /// Entry accepted and folded into the aggregate.
    pub applied: usize,
    /// Entry rejected because a higher-confidence value exists.
    pub kept: usize,
    pub topics: usize,
}

/// What `erase_user` removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Erasure {
    pub memory: bool,
    pub entries: usize,
    pub contexts: usize,
}

/// SQLite-backed store for user memories, memory entries and conversation
/// contexts.
///
/// Every operation opens its own connection and runs in one `IMMEDIATE`
/// transaction. Mutations additionally hold the per-user lock, so writes for
/// one user are serialized while different users proceed in parallel.
pub struct MemoryStore {
    path: PathBuf,
    limits: MemoryLimits,
    locks: UserLocks,
}

impl MemoryStore {
    /// Open (creating if needed) the database at `path`. Fails with
    /// `Validation` if any cap in `limits` is zero.
    pub fn open<P: AsRef<Path>>(path: P, limits: MemoryLimits) -> Result<Self> {
        limits.validate()?;

        let store = Self {
            path: path.as_ref().to_path_buf(),
            limits,
            locks: UserLocks::new(),
        };

        let conn = store.connect()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        init_schema(&conn)?;

        info!(path = %store.path.display(), "Memory store initialized");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Run `op` under the user's lock inside one IMMEDIATE transaction.
    fn write<T, F>(&self, user_id: &UserId, op: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let handle = self.locks.handle(user_id);
        let _guard = acquire(&handle);

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_user(&tx, user_id)?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Load (or lazily create) the aggregate, apply `op` and persist it.
    fn mutate<T, F>(&self, user_id: &UserId, op: F) -> Result<(UserMemory, T)>
    where
        F: FnOnce(&Transaction, &mut UserMemory, &str) -> Result<T>,
    {
        self.write(user_id, |tx| {
            let mut memory = load_or_create_memory(tx, user_id)?;
            let now = now();
            let value = op(tx, &mut memory, &now)?;
            memory.updated_at = now;
            save_memory(tx, &memory)?;
            Ok((memory, value))
        })
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Mirror a user id from the auth directory. Returns true if it was new.
    pub fn register_user(&self, user_id: &UserId) -> Result<bool> {
        if user_id.0.trim().is_empty() {
            return Err(MemoryError::validation("user id must not be empty"));
        }

        let conn = self.connect()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![user_id.0, now()],
        )?;

        if inserted > 0 {
            info!(user_id = %user_id, "Registered user");
        }
        Ok(inserted > 0)
    }

    pub fn user_exists(&self, user_id: &UserId) -> Result<bool> {
        let conn = self.connect()?;
        user_registered(&conn, user_id)
    }

    /// Remove everything stored for the user, including the user row.
    pub fn erase_user(&self, user_id: &UserId) -> Result<Erasure> {
        let erasure = self.write(user_id, |tx| {
            let entries = tx.execute(
                "DELETE FROM memory_entries WHERE user_id = ?1",
                params![user_id.0],
            )?;
            let contexts = tx.execute(
                "DELETE FROM conversation_contexts WHERE user_id = ?1",
                params![user_id.0],
            )?;
            let memory = tx.execute(
                "DELETE FROM user_memories WHERE user_id = ?1",
                params![user_id.0],
            )? > 0;
            tx.execute("DELETE FROM users WHERE id = ?1", params![user_id.0])?;

            Ok(Erasure {
                memory,
                entries,
                contexts,
            })
        })?;

        info!(
            user_id = %user_id,
            entries = erasure.entries,
            contexts = erasure.contexts,
            "Erased user memory"
        );
        Ok(erasure)
    }

    // ========================================================================
    // User Memory Aggregate
    // ========================================================================

    /// Idempotent. Concurrent first calls for one user converge on one row.
    pub fn get_or_create(&self, user_id: &UserId) -> Result<UserMemory> {
        let conn = self.connect()?;
        require_user(&conn, user_id)?;
        load_or_create_memory(&conn, user_id)
    }

    /// Read the aggregate for context assembly.
    pub fn snapshot(&self, user_id: &UserId) -> Result<UserMemory> {
        self.get_or_create(user_id)
    }

    /// Merge employee facts (last write wins per key) and record one
    /// `employee` entry per supplied key at explicit confidence.
    pub fn upsert_employee_facts(
        &self,
        user_id: &UserId,
        partial: EmployeeFacts,
    ) -> Result<UserMemory> {
        let (memory, recorded) = self.mutate(user_id, |tx, memory, now| {
            let pairs = partial.pairs();
            for (key, value) in &pairs {
                let entry = NewMemoryEntry::new(
                    MemoryCategory::Employee,
                    key,
                    value,
                    EXPLICIT_CONFIDENCE,
                )
                .with_tags(&["employee", "profile"]);
                upsert_entry(tx, user_id, &entry, now, &self.limits)?;
            }
            memory.employee_facts.merge(partial);
            Ok(pairs.len())
        })?;

        debug!(user_id = %user_id, keys = recorded, "Updated employee facts");
        Ok(memory)
    }

    pub fn upsert_team_info(&self, user_id: &UserId, partial: TeamInfo) -> Result<UserMemory> {
        let (memory, recorded) = self.mutate(user_id, |tx, memory, now| {
            let pairs = partial.pairs();
            for (key, value) in &pairs {
                let entry =
                    NewMemoryEntry::new(MemoryCategory::Team, key, value, EXPLICIT_CONFIDENCE)
                        .with_tags(&["team"]);
                upsert_entry(tx, user_id, &entry, now, &self.limits)?;
            }
            memory.team_info.merge(partial);
            Ok(pairs.len())
        })?;

        debug!(user_id = %user_id, keys = recorded, "Updated team info");
        Ok(memory)
    }

    /// Add or touch an active project. See `aggregate::apply_project`.
    pub fn add_active_project(
        &self,
        user_id: &UserId,
        update: &ProjectUpdate,
    ) -> Result<UserMemory> {
        let (memory, change) = self.mutate(user_id, |tx, memory, now| {
            let change = aggregate::apply_project(memory, update, now, &self.limits)?;
            let status = memory
                .find_active_project(&update.name)
                .map(|p| p.status)
                .unwrap_or(ProjectStatus::Done);

            let mut entry = NewMemoryEntry::new(
                MemoryCategory::Project,
                &project_key(&update.name),
                update.name.trim(),
                EXPLICIT_CONFIDENCE,
            )
            .with_tags(&["project"]);
            entry
                .metadata
                .insert("status".to_string(), status.as_str().to_string());
            if let Some(ref description) = update.description {
                entry
                    .metadata
                    .insert("description".to_string(), description.clone());
            }
            upsert_entry(tx, user_id, &entry, now, &self.limits)?;
            Ok(change)
        })?;

        debug!(user_id = %user_id, project = %update.name.trim(), ?change, "Recorded project");
        Ok(memory)
    }

    pub fn complete_project(
        &self,
        user_id: &UserId,
        name: &str,
        outcome: Option<String>,
    ) -> Result<UserMemory> {
        let (memory, _) = self.mutate(user_id, |tx, memory, now| {
            aggregate::complete_project(memory, name, outcome.clone(), now, &self.limits)?;

            let mut entry = NewMemoryEntry::new(
                MemoryCategory::Project,
                &project_key(name),
                name.trim(),
                EXPLICIT_CONFIDENCE,
            )
            .with_tags(&["project"]);
            entry.metadata.insert(
                "status".to_string(),
                ProjectStatus::Done.as_str().to_string(),
            );
            if let Some(outcome) = outcome {
                entry.metadata.insert("outcome".to_string(), outcome);
            }
            upsert_entry(tx, user_id, &entry, now, &self.limits)
        })?;

        info!(user_id = %user_id, project = %name.trim(), "Completed project");
        Ok(memory)
    }

    pub fn add_conversation_summary(
        &self,
        user_id: &UserId,
        topic: &str,
        resolution: &str,
    ) -> Result<UserMemory> {
        let (memory, _) = self.mutate(user_id, |_, memory, now| {
            aggregate::add_summary(memory, topic, resolution, now, &self.limits)
        })?;
        Ok(memory)
    }

    /// Set-union per tag set. Tags are never removed.
    pub fn update_domain_expertise(
        &self,
        user_id: &UserId,
        partial: DomainExpertise,
    ) -> Result<UserMemory> {
        let (memory, added) = self.mutate(user_id, |_, memory, _| {
            Ok(memory.domain_expertise.merge(partial))
        })?;

        debug!(user_id = %user_id, added, "Updated domain expertise");
        Ok(memory)
    }

    pub fn update_tech_preferences(
        &self,
        user_id: &UserId,
        partial: BTreeMap<String, String>,
    ) -> Result<UserMemory> {
        if partial.keys().any(|key| key.trim().is_empty()) {
            return Err(MemoryError::validation("preference keys must not be empty"));
        }

        let (memory, _) = self.mutate(user_id, |tx, memory, now| {
            for (key, value) in &partial {
                let entry = NewMemoryEntry::new(
                    MemoryCategory::Preference,
                    key.trim(),
                    value,
                    EXPLICIT_CONFIDENCE,
                )
                .with_tags(&["preference"]);
                upsert_entry(tx, user_id, &entry, now, &self.limits)?;
            }
            memory.tech_preferences.extend(
                partial
                    .into_iter()
                    .map(|(key, value)| (key.trim().to_string(), value)),
            );
            Ok(())
        })?;
        Ok(memory)
    }

    /// Increment the frequent-topic counter. Returns the new count.
    pub fn record_topic(&self, user_id: &UserId, topic: &str) -> Result<u64> {
        let (_, count) = self.mutate(user_id, |_, memory, now| {
            aggregate::bump_topic(memory, topic, now, &self.limits)
        })?;
        Ok(count)
    }

    /// `None` (or blank text) clears the notes.
    pub fn set_custom_notes(&self, user_id: &UserId, notes: Option<String>) -> Result<UserMemory> {
        let notes = notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        let (memory, _) = self.mutate(user_id, |_, memory, _| {
            memory.custom_notes = notes;
            Ok(())
        })?;
        Ok(memory)
    }

    pub fn record_interaction(&self, user_id: &UserId) -> Result<InteractionStats> {
        let (memory, _) = self.mutate(user_id, |_, memory, now| {
            aggregate::record_message(memory, now);
            Ok(())
        })?;
        Ok(memory.stats)
    }

    pub fn record_conversation_started(&self, user_id: &UserId) -> Result<InteractionStats> {
        let (memory, _) = self.mutate(user_id, |_, memory, now| {
            aggregate::record_conversation(memory, now);
            Ok(())
        })?;
        Ok(memory.stats)
    }

    /// Record every candidate as a memory entry and fold the accepted ones
    /// into the aggregate, all in one transaction.
    pub fn apply_extracted(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        facts: &[CandidateFact],
    ) -> Result<ExtractionOutcome> {
        if facts.is_empty() {
            return Ok(ExtractionOutcome::default());
        }

        let (_, outcome) = self.mutate(user_id, |tx, memory, now| {
            let mut outcome = ExtractionOutcome::default();
            for fact in facts {
                if let FactKind::Topic(topic) = &fact.kind {
                    aggregate::bump_topic(memory, topic, now, &self.limits)?;
                    outcome.topics += 1;
                    continue;
                }

                let Some(entry) = fact.to_entry(conversation_id) else {
                    continue;
                };
                let (write, existing) = upsert_entry(tx, user_id, &entry, now, &self.limits)?;
                if !write.is_applied() {
                    debug!(
                        user_id = %user_id,
                        key = %existing.key,
                        existing_confidence = existing.confidence,
                        candidate_confidence = fact.confidence,
                        "Kept higher-confidence entry"
                    );
                    outcome.kept += 1;
                    continue;
                }

                apply_fact(memory, &fact.kind, now, &self.limits)?;
                outcome.applied += 1;
            }
            Ok(outcome)
        })?;

        debug!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            applied = outcome.applied,
            kept = outcome.kept,
            "Applied extracted facts"
        );
        Ok(outcome)
    }

    // ========================================================================
    // Memory Entries
    // ========================================================================

    /// Insert, or update if the new confidence is at least the stored one.
    pub fn record_memory_entry(
        &self,
        user_id: &UserId,
        entry: &NewMemoryEntry,
    ) -> Result<RecordedEntry> {
        let (write, entry) = self.write(user_id, |tx| {
            upsert_entry(tx, user_id, entry, &now(), &self.limits)
        })?;
        Ok(RecordedEntry { write, entry })
    }

    /// Entries in insertion order, optionally filtered by category and tag.
    pub fn list_memory_entries(
        &self,
        user_id: &UserId,
        filter: &EntryFilter,
    ) -> Result<Vec<MemoryEntry>> {
        let conn = self.connect()?;
        require_user(&conn, user_id)?;

        let sql = format!(
            "SELECT {} FROM memory_entries
             WHERE user_id = ?1 AND (?2 IS NULL OR category = ?2)
             ORDER BY rowid ASC",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(
                params![user_id.0, filter.category.map(|c| c.as_str())],
                row_to_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(match filter.tag {
            Some(ref tag) => entries
                .into_iter()
                .filter(|e| e.tags.iter().any(|t| t == tag))
                .collect(),
            None => entries,
        })
    }

    pub fn count_memory_entries(&self, user_id: &UserId) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_entries WHERE user_id = ?1",
            params![user_id.0],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Conversation Contexts
    // ========================================================================

    pub fn get_or_create_context(
        &self,
        user_id: &UserId,
        context_key: &str,
        kind: Option<ContextKind>,
        title: Option<&str>,
    ) -> Result<ConversationContext> {
        let key = validate_context_key(context_key)?;
        self.write(user_id, |tx| load_or_create_context(tx, user_id, key, kind, title))
    }

    pub fn get_context(
        &self,
        user_id: &UserId,
        context_key: &str,
    ) -> Result<Option<ConversationContext>> {
        let key = validate_context_key(context_key)?;
        let conn = self.connect()?;
        require_user(&conn, user_id)?;
        load_context(&conn, user_id, key)
    }

    /// Most recently updated first.
    pub fn list_contexts(&self, user_id: &UserId) -> Result<Vec<ConversationContext>> {
        let conn = self.connect()?;
        require_user(&conn, user_id)?;

        let sql = format!(
            "SELECT {} FROM conversation_contexts
             WHERE user_id = ?1
             ORDER BY updated_at DESC, rowid DESC",
            CONTEXT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let contexts = stmt
            .query_map(params![user_id.0], row_to_context)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contexts)
    }

    /// Attach a conversation and its contribution to a context, creating the
    /// context if absent. A closed context is reopened; an archived one
    /// rejects contributions.
    pub fn append_to_context(
        &self,
        user_id: &UserId,
        context_key: &str,
        conversation_id: &ConversationId,
        contribution: ContextContribution,
    ) -> Result<ConversationContext> {
        let key = validate_context_key(context_key)?;
        let cap = self.limits.max_context_items;

        let context = self.write(user_id, |tx| {
            let mut context = load_or_create_context(tx, user_id, key, None, None)?;
            match context.status {
                ContextStatus::Archived => {
                    return Err(MemoryError::validation(format!(
                        "context {} is archived",
                        key
                    )))
                }
                ContextStatus::Closed => {
                    info!(user_id = %user_id, context_key = key, "Reopened context");
                    context.status = ContextStatus::Active;
                }
                ContextStatus::Active => {}
            }

            if !context.conversation_ids.contains(conversation_id) {
                context.conversation_ids.push(conversation_id.clone());
            }
            append_items(&mut context.key_facts, contribution.key_facts, cap);
            append_items(&mut context.decisions, contribution.decisions, cap);
            append_items(&mut context.action_items, contribution.action_items, cap);

            let now = now();
            context.updated_at = now.clone();
            context.last_contribution_at = Some(now);
            save_context(tx, &context)?;
            Ok(context)
        })?;

        debug!(
            user_id = %user_id,
            context_key = key,
            conversations = context.conversation_ids.len(),
            "Appended to context"
        );
        Ok(context)
    }

    pub fn close_context(&self, user_id: &UserId, context_key: &str) -> Result<ConversationContext> {
        self.set_context_status(user_id, context_key, ContextStatus::Closed)
    }

    pub fn archive_context(
        &self,
        user_id: &UserId,
        context_key: &str,
    ) -> Result<ConversationContext> {
        self.set_context_status(user_id, context_key, ContextStatus::Archived)
    }

    fn set_context_status(
        &self,
        user_id: &UserId,
        context_key: &str,
        target: ContextStatus,
    ) -> Result<ConversationContext> {
        let key = validate_context_key(context_key)?;
        self.write(user_id, |tx| {
            let mut context = load_context(tx, user_id, key)?
                .ok_or_else(|| MemoryError::NotFound(format!("context {}", key)))?;

            if context.status == ContextStatus::Archived && target != ContextStatus::Archived {
                return Err(MemoryError::validation(format!(
                    "context {} is archived",
                    key
                )));
            }

            if context.status != target {
                context.status = target;
                context.updated_at = now();
                save_context(tx, &context)?;
                info!(
                    user_id = %user_id,
                    context_key = key,
                    status = target.as_str(),
                    "Changed context status"
                );
            }
            Ok(context)
        })
    }
}

// ============================================================================
// Schema
// ============================================================================

fn init_schema(conn: &Connection) -> Result<()> {
    // Local mirror of the auth directory
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // One aggregate per user; list-shaped fields are JSON text
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_memories (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            employee_facts TEXT NOT NULL,
            team_info TEXT NOT NULL,
            active_projects TEXT NOT NULL,
            project_history TEXT NOT NULL,
            conversation_summaries TEXT NOT NULL,
            domain_expertise TEXT NOT NULL,
            tech_preferences TEXT NOT NULL,
            frequent_topics TEXT NOT NULL,
            custom_notes TEXT,
            total_conversations INTEGER NOT NULL DEFAULT 0,
            total_messages INTEGER NOT NULL DEFAULT 0,
            last_interaction TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS memory_entries (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            category TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            source_conversation_id TEXT,
            confidence INTEGER NOT NULL,
            tags TEXT NOT NULL,
            metadata TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_user_category_key
         ON memory_entries(user_id, category, key)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS conversation_contexts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            context_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL,
            conversation_ids TEXT NOT NULL,
            key_facts TEXT NOT NULL,
            decisions TEXT NOT NULL,
            action_items TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_contribution_at TEXT,
            UNIQUE (user_id, context_key),
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contexts_user_updated
         ON conversation_contexts(user_id, updated_at DESC)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn enum_error(column: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        format!("unknown value {:?}", raw).into(),
    )
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(json_error)
}

fn user_registered(conn: &Connection, user_id: &UserId) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ?1",
            params![user_id.0],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn require_user(conn: &Connection, user_id: &UserId) -> Result<()> {
    if user_registered(conn, user_id)? {
        Ok(())
    } else {
        Err(MemoryError::unknown_user(user_id))
    }
}

fn validate_context_key(key: &str) -> Result<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(MemoryError::validation("context key must not be empty"));
    }
    if key.chars().count() > MAX_CONTEXT_KEY_CHARS {
        return Err(MemoryError::validation(format!(
            "context key longer than {} characters",
            MAX_CONTEXT_KEY_CHARS
        )));
    }
    Ok(key)
}

/// Append non-blank items not already present, keeping the newest `cap`.
fn append_items(items: &mut Vec<String>, incoming: Vec<String>, cap: usize) {
    for item in incoming {
        let item = item.trim().to_string();
        if item.is_empty() || items.contains(&item) {
            continue;
        }
        push_bounded(items, item, cap);
    }
}

fn apply_fact(
    memory: &mut UserMemory,
    kind: &FactKind,
    now: &str,
    limits: &MemoryLimits,
) -> Result<()> {
    match kind {
        FactKind::FullName(name) => memory.employee_facts.full_name = Some(name.clone()),
        FactKind::Team(team) => memory.team_info.team = Some(team.clone()),
        FactKind::Project(name) => {
            let update = ProjectUpdate {
                name: name.clone(),
                status: None,
                description: None,
            };
            aggregate::apply_project(memory, &update, now, limits)?;
        }
        FactKind::StateWorked(code) => {
            memory
                .domain_expertise
                .merge(DomainExpertise::with_tag(STATES_WORKED, code));
        }
        FactKind::ClassificationCode(code) => {
            memory
                .domain_expertise
                .merge(DomainExpertise::with_tag(CLASSIFICATION_CODES, code));
        }
        FactKind::TechPreference { key, value } => {
            memory.tech_preferences.insert(key.clone(), value.clone());
        }
        FactKind::Topic(_) | FactKind::Decision(_) | FactKind::ActionItem(_) => {}
    }
    Ok(())
}

// ============================================================================
// User Memory Rows
// ============================================================================

fn row_to_memory(row: &Row) -> rusqlite::Result<UserMemory> {
    Ok(UserMemory {
        id: UserMemoryId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        employee_facts: json_column(row, 2)?,
        team_info: json_column(row, 3)?,
        active_projects: json_column(row, 4)?,
        project_history: json_column(row, 5)?,
        conversation_summaries: json_column(row, 6)?,
        domain_expertise: json_column(row, 7)?,
        tech_preferences: json_column(row, 8)?,
        frequent_topics: json_column(row, 9)?,
        custom_notes: row.get(10)?,
        stats: InteractionStats {
            total_conversations: row.get::<_, i64>(11)? as u64,
            total_messages: row.get::<_, i64>(12)? as u64,
            last_interaction: row.get(13)?,
        },
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn load_memory(conn: &Connection, user_id: &UserId) -> Result<Option<UserMemory>> {
    let sql = format!(
        "SELECT {} FROM user_memories WHERE user_id = ?1",
        MEMORY_COLUMNS
    );
    let memory = conn
        .query_row(&sql, params![user_id.0], row_to_memory)
        .optional()?;
    Ok(memory)
}

fn insert_memory(conn: &Connection, memory: &UserMemory) -> Result<()> {
    let sql = format!(
        "INSERT INTO user_memories ({})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        MEMORY_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            memory.id.0,
            memory.user_id.0,
            to_json(&memory.employee_facts)?,
            to_json(&memory.team_info)?,
            to_json(&memory.active_projects)?,
            to_json(&memory.project_history)?,
            to_json(&memory.conversation_summaries)?,
            to_json(&memory.domain_expertise)?,
            to_json(&memory.tech_preferences)?,
            to_json(&memory.frequent_topics)?,
            memory.custom_notes,
            memory.stats.total_conversations as i64,
            memory.stats.total_messages as i64,
            memory.stats.last_interaction,
            memory.created_at,
            memory.updated_at,
        ],
    )?;
    Ok(())
}

fn save_memory(conn: &Connection, memory: &UserMemory) -> Result<()> {
    conn.execute(
        "UPDATE user_memories SET
            employee_facts = ?1, team_info = ?2, active_projects = ?3,
            project_history = ?4, conversation_summaries = ?5, domain_expertise = ?6,
            tech_preferences = ?7, frequent_topics = ?8, custom_notes = ?9,
            total_conversations = ?10, total_messages = ?11, last_interaction = ?12,
            updated_at = ?13
         WHERE id = ?14",
        params![
            to_json(&memory.employee_facts)?,
            to_json(&memory.team_info)?,
            to_json(&memory.active_projects)?,
            to_json(&memory.project_history)?,
            to_json(&memory.conversation_summaries)?,
            to_json(&memory.domain_expertise)?,
            to_json(&memory.tech_preferences)?,
            to_json(&memory.frequent_topics)?,
            memory.custom_notes,
            memory.stats.total_conversations as i64,
            memory.stats.total_messages as i64,
            memory.stats.last_interaction,
            memory.updated_at,
            memory.id.0,
        ],
    )?;
    Ok(())
}

/// Read the aggregate, creating it if absent. A creation that loses a race
/// against another connection falls back to reading the winner's row.
fn load_or_create_memory(conn: &Connection, user_id: &UserId) -> Result<UserMemory> {
    if let Some(memory) = load_memory(conn, user_id)? {
        return Ok(memory);
    }

    let memory = UserMemory::empty(generate_user_memory_id(), user_id.clone(), &now());
    match insert_memory(conn, &memory) {
        Ok(()) => {
            info!(user_id = %user_id, memory_id = %memory.id, "Created user memory");
            Ok(memory)
        }
        Err(err) if err.is_constraint_violation() => {
            debug!(user_id = %user_id, "Lost creation race, reading existing memory");
            load_memory(conn, user_id)?
                .ok_or_else(|| MemoryError::NotFound(format!("memory for user {}", user_id)))
        }
        Err(err) => Err(err),
    }
}

// ============================================================================
// Memory Entry Rows
// ============================================================================

fn row_to_entry(row: &Row) -> rusqlite::Result<MemoryEntry> {
    let category: String = row.get(2)?;
    Ok(MemoryEntry {
        id: EntryId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        category: MemoryCategory::parse(&category).ok_or_else(|| enum_error(2, &category))?,
        key: row.get(3)?,
        value: row.get(4)?,
        source_conversation_id: row.get::<_, Option<String>>(5)?.map(ConversationId),
        confidence: row.get(6)?,
        tags: json_column(row, 7)?,
        metadata: json_column(row, 8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Insert-or-update by (user, category, key). An update happens only when
/// the incoming confidence is at least the stored one; tags are unioned and
/// metadata merged. Inserts past the per-user cap evict the oldest entries.
fn upsert_entry(
    conn: &Connection,
    user_id: &UserId,
    entry: &NewMemoryEntry,
    now: &str,
    limits: &MemoryLimits,
) -> Result<(EntryWrite, MemoryEntry)> {
    let key = entry.key.trim();
    if key.is_empty() {
        return Err(MemoryError::validation("entry key must not be empty"));
    }
    if entry.confidence > 100 {
        return Err(MemoryError::validation(format!(
            "confidence must be within 0-100, got {}",
            entry.confidence
        )));
    }

    let sql = format!(
        "SELECT {} FROM memory_entries WHERE user_id = ?1 AND category = ?2 AND key = ?3",
        ENTRY_COLUMNS
    );
    let existing = conn
        .query_row(
            &sql,
            params![user_id.0, entry.category.as_str(), key],
            row_to_entry,
        )
        .optional()?;

    if let Some(mut current) = existing {
        if entry.confidence < current.confidence {
            return Ok((EntryWrite::Kept, current));
        }

        current.value = entry.value.clone();
        current.confidence = entry.confidence;
        if entry.source_conversation_id.is_some() {
            current.source_conversation_id = entry.source_conversation_id.clone();
        }
        for tag in &entry.tags {
            if !current.tags.contains(tag) {
                current.tags.push(tag.clone());
            }
        }
        current.metadata.extend(entry.metadata.clone());
        current.updated_at = now.to_string();

        conn.execute(
            "UPDATE memory_entries SET
                value = ?1, confidence = ?2, source_conversation_id = ?3,
                tags = ?4, metadata = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                current.value,
                current.confidence,
                current.source_conversation_id.as_ref().map(|c| c.0.as_str()),
                to_json(&current.tags)?,
                to_json(&current.metadata)?,
                current.updated_at,
                current.id.0,
            ],
        )?;
        return Ok((EntryWrite::Updated, current));
    }

    let mut tags: Vec<String> = Vec::with_capacity(entry.tags.len());
    for tag in &entry.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }

    let created = MemoryEntry {
        id: generate_entry_id(),
        user_id: user_id.clone(),
        category: entry.category,
        key: key.to_string(),
        value: entry.value.clone(),
        source_conversation_id: entry.source_conversation_id.clone(),
        confidence: entry.confidence,
        tags,
        metadata: entry.metadata.clone(),
        created_at: now.to_string(),
        updated_at: now.to_string(),
    };

    let sql = format!(
        "INSERT INTO memory_entries ({})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        ENTRY_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            created.id.0,
            created.user_id.0,
            created.category.as_str(),
            created.key,
            created.value,
            created.source_conversation_id.as_ref().map(|c| c.0.as_str()),
            created.confidence,
            to_json(&created.tags)?,
            to_json(&created.metadata)?,
            created.created_at,
            created.updated_at,
        ],
    )?;

    let evicted = conn.execute(
        "DELETE FROM memory_entries WHERE id IN (
            SELECT id FROM memory_entries WHERE user_id = ?1
            ORDER BY rowid ASC
            LIMIT max(0, (SELECT COUNT(*) FROM memory_entries WHERE user_id = ?1) - ?2)
         )",
        params![user_id.0, limits.max_memory_entries as i64],
    )?;
    if evicted > 0 {
        debug!(user_id = %user_id, evicted, "Evicted oldest memory entries");
    }

    Ok((EntryWrite::Inserted, created))
}

// ============================================================================
// Conversation Context Rows
// ============================================================================

fn row_to_context(row: &Row) -> rusqlite::Result<ConversationContext> {
    let kind: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(ConversationContext {
        id: ContextId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        context_key: row.get(2)?,
        kind: ContextKind::parse(&kind).ok_or_else(|| enum_error(3, &kind))?,
        title: row.get(4)?,
        description: row.get(5)?,
        status: ContextStatus::parse(&status).ok_or_else(|| enum_error(6, &status))?,
        conversation_ids: json_column(row, 7)?,
        key_facts: json_column(row, 8)?,
        decisions: json_column(row, 9)?,
        action_items: json_column(row, 10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        last_contribution_at: row.get(13)?,
    })
}

fn load_context(
    conn: &Connection,
    user_id: &UserId,
    key: &str,
) -> Result<Option<ConversationContext>> {
    let sql = format!(
        "SELECT {} FROM conversation_contexts WHERE user_id = ?1 AND context_key = ?2",
        CONTEXT_COLUMNS
    );
    let context = conn
        .query_row(&sql, params![user_id.0, key], row_to_context)
        .optional()?;
    Ok(context)
}

fn load_or_create_context(
    conn: &Connection,
    user_id: &UserId,
    key: &str,
    kind: Option<ContextKind>,
    title: Option<&str>,
) -> Result<ConversationContext> {
    if let Some(context) = load_context(conn, user_id, key)? {
        return Ok(context);
    }

    let now = now();
    let context = ConversationContext {
        id: generate_context_id(),
        user_id: user_id.clone(),
        context_key: key.to_string(),
        kind: kind.unwrap_or_default(),
        title: title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(key)
            .to_string(),
        description: None,
        status: ContextStatus::Active,
        conversation_ids: Vec::new(),
        key_facts: Vec::new(),
        decisions: Vec::new(),
        action_items: Vec::new(),
        created_at: now.clone(),
        updated_at: now,
        last_contribution_at: None,
    };

    let sql = format!(
        "INSERT INTO conversation_contexts ({})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        CONTEXT_COLUMNS
    );
    let inserted = conn.execute(
        &sql,
        params![
            context.id.0,
            context.user_id.0,
            context.context_key,
            context.kind.as_str(),
            context.title,
            context.description,
            context.status.as_str(),
            to_json(&context.conversation_ids)?,
            to_json(&context.key_facts)?,
            to_json(&context.decisions)?,
            to_json(&context.action_items)?,
            context.created_at,
            context.updated_at,
            context.last_contribution_at,
        ],
    );

    match inserted {
        Ok(_) => {
            info!(user_id = %user_id, context_key = key, "Created conversation context");
            Ok(context)
        }
        Err(err) => {
            let err = MemoryError::from(err);
            if err.is_constraint_violation() {
                load_context(conn, user_id, key)?
                    .ok_or_else(|| MemoryError::NotFound(format!("context {}", key)))
            } else {
                Err(err)
            }
        }
    }
}

fn save_context(conn: &Connection, context: &ConversationContext) -> Result<()> {
    conn.execute(
        "UPDATE conversation_contexts SET
            kind = ?1, title = ?2, description = ?3, status = ?4,
            conversation_ids = ?5, key_facts = ?6, decisions = ?7, action_items = ?8,
            updated_at = ?9, last_contribution_at = ?10
         WHERE id = ?11",
        params![
            context.kind.as_str(),
            context.title,
            context.description,
            context.status.as_str(),
            to_json(&context.conversation_ids)?,
            to_json(&context.key_facts)?,
            to_json(&context.decisions)?,
            to_json(&context.action_items)?,
            context.updated_at,
            context.last_contribution_at,
            context.id.0,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store_with(limits: MemoryLimits) -> (NamedTempFile, MemoryStore) {
        let temp = NamedTempFile::new().unwrap();
        let store = MemoryStore::open(temp.path(), limits).unwrap();
        (temp, store)
    }

    fn registered(store: &MemoryStore, id: &str) -> UserId {
        let user_id = UserId(id.to_string());
        store.register_user(&user_id).unwrap();
        user_id
    }

    #[test]
    fn test_store_creation_rejects_zero_caps() {
        let temp = NamedTempFile::new().unwrap();
        let limits = MemoryLimits {
            max_frequent_topics: 0,
            ..MemoryLimits::default()
        };
        let result = MemoryStore::open(temp.path(), limits);
        assert!(matches!(result, Err(MemoryError::Validation(_))));
    }

    #[test]
    fn test_register_user_is_idempotent() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let user_id = UserId("u_1".into());

        assert!(!store.user_exists(&user_id).unwrap());
        assert!(store.register_user(&user_id).unwrap());
        assert!(!store.register_user(&user_id).unwrap());
        assert!(store.user_exists(&user_id).unwrap());
    }

    #[test]
    fn test_unknown_user_is_not_found() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let ghost = UserId("ghost".into());

        assert!(store.get_or_create(&ghost).unwrap_err().is_not_found());
        assert!(store
            .add_conversation_summary(&ghost, "topic", "done")
            .unwrap_err()
            .is_not_found());
        assert!(store.list_contexts(&ghost).unwrap_err().is_not_found());
    }

    #[test]
    fn test_aggregate_round_trips_through_sqlite() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let user_id = registered(&store, "u_1");

        store
            .update_domain_expertise(&user_id, DomainExpertise::with_tag(STATES_WORKED, "CA"))
            .unwrap();
        store.set_custom_notes(&user_id, Some("  Prefers SQL  ".into())).unwrap();
        store.record_conversation_started(&user_id).unwrap();
        let stats = store.record_interaction(&user_id).unwrap();
        assert_eq!(stats.total_messages, 1);

        let memory = store.snapshot(&user_id).unwrap();
        assert!(memory.domain_expertise.contains(STATES_WORKED, "CA"));
        assert_eq!(memory.custom_notes.as_deref(), Some("Prefers SQL"));
        assert_eq!(memory.stats.total_conversations, 1);
        assert_eq!(memory.stats.total_messages, 1);
        assert!(memory.stats.last_interaction.is_some());
    }

    #[test]
    fn test_entry_cap_evicts_oldest() {
        let (_temp, store) = store_with(MemoryLimits {
            max_memory_entries: 3,
            ..MemoryLimits::default()
        });
        let user_id = registered(&store, "u_1");

        for i in 0..5 {
            let entry = NewMemoryEntry::new(MemoryCategory::Note, &format!("k{}", i), "v", 80);
            store.record_memory_entry(&user_id, &entry).unwrap();
        }

        let keys: Vec<_> = store
            .list_memory_entries(&user_id, &EntryFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["k2", "k3", "k4"]);
    }

    #[test]
    fn test_entry_validation() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let user_id = registered(&store, "u_1");

        let blank = NewMemoryEntry::new(MemoryCategory::Note, "  ", "v", 50);
        assert!(matches!(
            store.record_memory_entry(&user_id, &blank),
            Err(MemoryError::Validation(_))
        ));

        let too_sure = NewMemoryEntry::new(MemoryCategory::Note, "k", "v", 101);
        assert!(matches!(
            store.record_memory_entry(&user_id, &too_sure),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn test_entry_filters() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let user_id = registered(&store, "u_1");

        store
            .upsert_employee_facts(
                &user_id,
                EmployeeFacts {
                    full_name: Some("John".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .record_memory_entry(
                &user_id,
                &NewMemoryEntry::new(MemoryCategory::Note, "parking", "Level 3", 90)
                    .with_tags(&["office"]),
            )
            .unwrap();

        let employee = store
            .list_memory_entries(
                &user_id,
                &EntryFilter {
                    category: Some(MemoryCategory::Employee),
                    tag: None,
                },
            )
            .unwrap();
        assert_eq!(employee.len(), 1);
        assert_eq!(employee[0].key, "full_name");
        assert_eq!(employee[0].confidence, EXPLICIT_CONFIDENCE);

        let office = store
            .list_memory_entries(
                &user_id,
                &EntryFilter {
                    category: None,
                    tag: Some("office".into()),
                },
            )
            .unwrap();
        assert_eq!(office.len(), 1);
        assert_eq!(office[0].value, "Level 3");
    }

    #[test]
    fn test_context_lifecycle() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let user_id = registered(&store, "u_1");
        let conversation = ConversationId("conv_1".into());

        let created = store
            .get_or_create_context(&user_id, "WC_MIGRATION_2024", Some(ContextKind::Project), None)
            .unwrap();
        assert_eq!(created.title, "WC_MIGRATION_2024");
        assert_eq!(created.status, ContextStatus::Active);

        let closed = store.close_context(&user_id, "WC_MIGRATION_2024").unwrap();
        assert_eq!(closed.status, ContextStatus::Closed);

        let reopened = store
            .append_to_context(
                &user_id,
                "WC_MIGRATION_2024",
                &conversation,
                ContextContribution::default(),
            )
            .unwrap();
        assert_eq!(reopened.status, ContextStatus::Active);

        store.archive_context(&user_id, "WC_MIGRATION_2024").unwrap();
        let rejected = store.append_to_context(
            &user_id,
            "WC_MIGRATION_2024",
            &conversation,
            ContextContribution::default(),
        );
        assert!(matches!(rejected, Err(MemoryError::Validation(_))));
        assert!(matches!(
            store.close_context(&user_id, "WC_MIGRATION_2024"),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn test_context_key_validation() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let user_id = registered(&store, "u_1");

        assert!(matches!(
            store.get_or_create_context(&user_id, "   ", None, None),
            Err(MemoryError::Validation(_))
        ));
        let long_key = "k".repeat(MAX_CONTEXT_KEY_CHARS + 1);
        assert!(matches!(
            store.get_context(&user_id, &long_key),
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            store.close_context(&user_id, "missing"),
            Err(MemoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_context_items_are_bounded() {
        let (_temp, store) = store_with(MemoryLimits {
            max_context_items: 2,
            ..MemoryLimits::default()
        });
        let user_id = registered(&store, "u_1");
        let conversation = ConversationId("conv_1".into());

        let contribution = ContextContribution {
            key_facts: vec!["a".into(), "b".into(), " ".into(), "c".into()],
            decisions: vec![],
            action_items: vec!["x".into(), "x".into()],
        };
        let context = store
            .append_to_context(&user_id, "topic", &conversation, contribution)
            .unwrap();

        assert_eq!(context.key_facts, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(context.action_items, vec!["x".to_string()]);
        assert!(context.last_contribution_at.is_some());
    }

    #[test]
    fn test_erase_user_removes_everything() {
        let (_temp, store) = store_with(MemoryLimits::default());
        let user_id = registered(&store, "u_1");
        let other = registered(&store, "u_2");

        store
            .upsert_team_info(
                &user_id,
                TeamInfo {
                    team: Some("Claims".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .get_or_create_context(&user_id, "ISSUE-7", Some(ContextKind::Issue), None)
            .unwrap();
        store.get_or_create(&other).unwrap();

        let erasure = store.erase_user(&user_id).unwrap();
        assert!(erasure.memory);
        assert_eq!(erasure.entries, 1);
        assert_eq!(erasure.contexts, 1);

        assert!(!store.user_exists(&user_id).unwrap());
        assert_eq!(store.count_memory_entries(&user_id).unwrap(), 0);
        assert!(store.get_or_create(&other).is_ok());
        assert!(store.erase_user(&user_id).unwrap_err().is_not_found());
    }
}
