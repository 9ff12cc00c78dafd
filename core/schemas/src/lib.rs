use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Confidence attached to facts supplied through explicit API updates.
pub const EXPLICIT_CONFIDENCE: u8 = 100;

/// Ceiling for heuristically extracted facts. Kept below
/// `EXPLICIT_CONFIDENCE` so explicit updates always win ties.
pub const EXTRACTION_CONFIDENCE_CAP: u8 = 70;

/// Domain-expertise tag set holding US state codes.
pub const STATES_WORKED: &str = "states_worked";

/// Domain-expertise tag set holding four-digit classification codes.
pub const CLASSIFICATION_CODES: &str = "classification_codes";

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserMemoryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserMemoryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(raw: &str) -> Self {
        UserId(raw.to_string())
    }
}

impl From<&str> for ConversationId {
    fn from(raw: &str) -> Self {
        ConversationId(raw.to_string())
    }
}

// ============================================================================
// User Memory Aggregate
// ============================================================================

/// Everything the assistant durably knows about one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMemory {
    pub id: UserMemoryId,
    pub user_id: UserId,
    pub employee_facts: EmployeeFacts,
    pub team_info: TeamInfo,
    /// Ordered least-recently-touched first.
    pub active_projects: Vec<ActiveProject>,
    pub project_history: Vec<CompletedProject>,
    /// Insertion order, oldest first.
    pub conversation_summaries: Vec<ConversationSummary>,
    pub domain_expertise: DomainExpertise,
    pub tech_preferences: BTreeMap<String, String>,
    pub frequent_topics: Vec<TopicCounter>,
    pub custom_notes: Option<String>,
    pub stats: InteractionStats,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

impl UserMemory {
    pub fn empty(id: UserMemoryId, user_id: UserId, now: &str) -> Self {
        Self {
            id,
            user_id,
            employee_facts: EmployeeFacts::default(),
            team_info: TeamInfo::default(),
            active_projects: Vec::new(),
            project_history: Vec::new(),
            conversation_summaries: Vec::new(),
            domain_expertise: DomainExpertise::default(),
            tech_preferences: BTreeMap::new(),
            frequent_topics: Vec::new(),
            custom_notes: None,
            stats: InteractionStats::default(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// Case-insensitive lookup of an active project.
    pub fn find_active_project(&self, name: &str) -> Option<&ActiveProject> {
        self.active_projects.iter().find(|p| p.matches_name(name))
    }
}

/// Employee identity facts. Known attributes are typed fields; anything
/// else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hire_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specializations: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl EmployeeFacts {
    /// Last-write-wins per key; keys absent from `partial` are untouched.
    pub fn merge(&mut self, partial: EmployeeFacts) {
        if partial.full_name.is_some() {
            self.full_name = partial.full_name;
        }
        if partial.title.is_some() {
            self.title = partial.title;
        }
        if partial.hire_date.is_some() {
            self.hire_date = partial.hire_date;
        }
        if partial.location.is_some() {
            self.location = partial.location;
        }
        if partial.specializations.is_some() {
            self.specializations = partial.specializations;
        }
        self.extra.extend(partial.extra);
    }

    /// Key/value pairs in a stable order: known keys first, then `extra`
    /// sorted by key.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        push_pair(&mut pairs, "full_name", self.full_name.as_deref());
        push_pair(&mut pairs, "title", self.title.as_deref());
        push_pair(&mut pairs, "hire_date", self.hire_date.as_deref());
        push_pair(&mut pairs, "location", self.location.as_deref());
        if let Some(ref specs) = self.specializations {
            if !specs.is_empty() {
                pairs.push(("specializations".to_string(), specs.join(", ")));
            }
        }
        for (key, value) in &self.extra {
            pairs.push((key.clone(), value.clone()));
        }
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }
}

/// Team and company facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl TeamInfo {
    pub fn merge(&mut self, partial: TeamInfo) {
        if partial.team.is_some() {
            self.team = partial.team;
        }
        if partial.manager.is_some() {
            self.manager = partial.manager;
        }
        if partial.company.is_some() {
            self.company = partial.company;
        }
        self.extra.extend(partial.extra);
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        push_pair(&mut pairs, "team", self.team.as_deref());
        push_pair(&mut pairs, "manager", self.manager.as_deref());
        push_pair(&mut pairs, "company", self.company.as_deref());
        for (key, value) in &self.extra {
            pairs.push((key.clone(), value.clone()));
        }
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }
}

fn push_pair(pairs: &mut Vec<(String, String)>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        if !value.trim().is_empty() {
            pairs.push((key.to_string(), value.to_string()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[serde(rename = "planning")]
    Planning,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "done")]
    Done,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Planning => "planning",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Blocked => "blocked",
            ProjectStatus::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProject {
    pub name: String,
    pub status: ProjectStatus,
    pub description: Option<String>,
    pub last_touched: String, // RFC3339
}

impl ActiveProject {
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.trim().to_lowercase() == name.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedProject {
    pub name: String,
    pub status: ProjectStatus,
    pub description: Option<String>,
    pub outcome: Option<String>,
    pub completed_at: String, // RFC3339
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub topic: String,
    pub resolution: String,
    pub timestamp: String, // RFC3339
}

/// Named tag sets, e.g. `states_worked` -> {CA, NY}. Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainExpertise(pub BTreeMap<String, BTreeSet<String>>);

impl DomainExpertise {
    /// Set-union merge. Returns the number of tags that were new.
    pub fn merge(&mut self, partial: DomainExpertise) -> usize {
        let mut added = 0;
        for (set_name, tags) in partial.0 {
            let existing = self.0.entry(set_name).or_default();
            for tag in tags {
                let tag = tag.trim().to_string();
                if !tag.is_empty() && existing.insert(tag) {
                    added += 1;
                }
            }
        }
        self.0.retain(|_, tags| !tags.is_empty());
        added
    }

    pub fn with_tag(set_name: &str, tag: &str) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(set_name.to_string(), BTreeSet::from([tag.to_string()]));
        DomainExpertise(sets)
    }

    pub fn contains(&self, set_name: &str, tag: &str) -> bool {
        self.0.get(set_name).map(|s| s.contains(tag)).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|tags| tags.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCounter {
    pub topic: String,
    pub count: u64,
    pub first_seen: String, // RFC3339
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionStats {
    pub total_conversations: u64,
    pub total_messages: u64,
    pub last_interaction: Option<String>, // RFC3339
}

// ============================================================================
// Memory Entry Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryCategory {
    #[serde(rename = "employee")]
    Employee,
    #[serde(rename = "team")]
    Team,
    #[serde(rename = "project")]
    Project,
    #[serde(rename = "domain")]
    Domain,
    #[serde(rename = "technical")]
    Technical,
    #[serde(rename = "preference")]
    Preference,
    #[serde(rename = "topic")]
    Topic,
    #[serde(rename = "note")]
    Note,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Employee => "employee",
            MemoryCategory::Team => "team",
            MemoryCategory::Project => "project",
            MemoryCategory::Domain => "domain",
            MemoryCategory::Technical => "technical",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Topic => "topic",
            MemoryCategory::Note => "note",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "employee" => Some(MemoryCategory::Employee),
            "team" => Some(MemoryCategory::Team),
            "project" => Some(MemoryCategory::Project),
            "domain" => Some(MemoryCategory::Domain),
            "technical" => Some(MemoryCategory::Technical),
            "preference" => Some(MemoryCategory::Preference),
            "topic" => Some(MemoryCategory::Topic),
            "note" => Some(MemoryCategory::Note),
            _ => None,
        }
    }
}

/// A single granular, independently queryable fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub category: MemoryCategory,
    pub key: String,
    pub value: String,
    /// Weak reference; the conversation may be gone.
    pub source_conversation_id: Option<ConversationId>,
    pub confidence: u8, // 0-100
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

fn default_confidence() -> u8 {
    EXPLICIT_CONFIDENCE
}

/// Input for `record_memory_entry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemoryEntry {
    pub category: MemoryCategory,
    pub key: String,
    pub value: String,
    #[serde(default = "default_confidence")]
    pub confidence: u8,
    #[serde(default)]
    pub source_conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NewMemoryEntry {
    pub fn new(category: MemoryCategory, key: &str, value: &str, confidence: u8) -> Self {
        Self {
            category,
            key: key.to_string(),
            value: value.to_string(),
            confidence,
            source_conversation_id: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, conversation_id: &ConversationId) -> Self {
        self.source_conversation_id = Some(conversation_id.clone());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// Outcome of `record_memory_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryWrite {
    #[serde(rename = "inserted")]
    Inserted,
    #[serde(rename = "updated")]
    Updated,
    /// Existing entry had higher confidence and was left as is.
    #[serde(rename = "kept")]
    Kept,
}

impl EntryWrite {
    pub fn is_applied(&self) -> bool {
        !matches!(self, EntryWrite::Kept)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    #[serde(default)]
    pub category: Option<MemoryCategory>,
    #[serde(default)]
    pub tag: Option<String>,
}

// ============================================================================
// Conversation Context Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "archived")]
    Archived,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Active => "active",
            ContextStatus::Closed => "closed",
            ContextStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(ContextStatus::Active),
            "closed" => Some(ContextStatus::Closed),
            "archived" => Some(ContextStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextKind {
    #[default]
    #[serde(rename = "project")]
    Project,
    #[serde(rename = "issue")]
    Issue,
    #[serde(rename = "topic")]
    Topic,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Project => "project",
            ContextKind::Issue => "issue",
            ContextKind::Topic => "topic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "project" => Some(ContextKind::Project),
            "issue" => Some(ContextKind::Issue),
            "topic" => Some(ContextKind::Topic),
            _ => None,
        }
    }
}

/// A named thread that outlives any single chat session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub id: ContextId,
    pub user_id: UserId,
    pub context_key: String,
    pub kind: ContextKind,
    pub title: String,
    pub description: Option<String>,
    pub status: ContextStatus,
    pub conversation_ids: Vec<ConversationId>,
    pub key_facts: Vec<String>,
    pub decisions: Vec<String>,
    pub action_items: Vec<String>,
    pub created_at: String,                   // RFC3339
    pub updated_at: String,                   // RFC3339
    pub last_contribution_at: Option<String>, // RFC3339
}

impl ConversationContext {
    pub fn has_content(&self) -> bool {
        !self.key_facts.is_empty() || !self.decisions.is_empty() || !self.action_items.is_empty()
    }
}

/// One conversation's contribution to a context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextContribution {
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
}

// ============================================================================
// Context Assembly Schema
// ============================================================================

/// Sections of the assembled context, in descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionKind {
    #[serde(rename = "identity")]
    Identity,
    #[serde(rename = "team")]
    Team,
    #[serde(rename = "active_projects")]
    ActiveProjects,
    #[serde(rename = "domain_expertise")]
    DomainExpertise,
    #[serde(rename = "conversation_context")]
    ConversationContext,
    #[serde(rename = "conversation_summaries")]
    ConversationSummaries,
}

impl SectionKind {
    pub const PRIORITY: [SectionKind; 6] = [
        SectionKind::Identity,
        SectionKind::Team,
        SectionKind::ActiveProjects,
        SectionKind::DomainExpertise,
        SectionKind::ConversationContext,
        SectionKind::ConversationSummaries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Identity => "identity",
            SectionKind::Team => "team",
            SectionKind::ActiveProjects => "active_projects",
            SectionKind::DomainExpertise => "domain_expertise",
            SectionKind::ConversationContext => "conversation_context",
            SectionKind::ConversationSummaries => "conversation_summaries",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedSection {
    pub kind: SectionKind,
    pub text: String,
}

/// Prompt-grounding block handed to the LLM as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub text: String,
    pub sections: Vec<RenderedSection>,
    pub dropped: Vec<SectionKind>,
    pub token_count: u64,
    pub budget_tokens: u64,
    pub truncated: bool,
}

impl MemoryContext {
    pub fn empty(budget_tokens: u64) -> Self {
        Self {
            text: String::new(),
            sections: Vec::new(),
            dropped: Vec::new(),
            token_count: 0,
            budget_tokens,
            truncated: false,
        }
    }

    pub fn has_section(&self, kind: SectionKind) -> bool {
        self.sections.iter().any(|s| s.kind == kind)
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    #[serde(default)]
    pub context_key: Option<String>,
    pub budget_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectUpdate {
    pub name: String,
    #[serde(default)]
    pub status: Option<ProjectStatus>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteProjectRequest {
    pub name: String,
    #[serde(default)]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub topic: String,
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationCreate {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub context_key: Option<String>,
    #[serde(default)]
    pub context_kind: Option<ContextKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub conversation_id: ConversationId,
    pub context: Option<ConversationContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreate {
    pub content: String,
    #[serde(default)]
    pub context_key: Option<String>,
}

/// An inbound user message handed to fact extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub context_key: Option<String>,
    pub received_at: String, // RFC3339
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_user_memory_id() -> UserMemoryId {
    UserMemoryId(format!("umem_{}", ulid::Ulid::new()))
}

pub fn generate_entry_id() -> EntryId {
    EntryId(format!("ent_{}", ulid::Ulid::new()))
}

pub fn generate_context_id() -> ContextId {
    ContextId(format!("ctx_{}", ulid::Ulid::new()))
}

pub fn generate_conversation_id() -> ConversationId {
    ConversationId(format!("conv_{}", ulid::Ulid::new()))
}
