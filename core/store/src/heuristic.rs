use regex::Regex;
use tracing::debug;
use user_memory_schemas::{
    ConversationId, MemoryCategory, NewMemoryEntry, CLASSIFICATION_CODES,
    EXTRACTION_CONFIDENCE_CAP, STATES_WORKED,
};

/// US state and territory codes with their names.
const US_STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("DC", "District of Columbia"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
];

/// Codes that double as everyday uppercase words. Only their full names count.
const AMBIGUOUS_CODES: &[&str] = &["HI", "ID", "IN", "ME", "OH", "OK", "OR"];

/// Capitalized words that follow "I'm" without being a name.
const NOT_NAMES: &[&str] = &[
    "Not", "Going", "Working", "Trying", "Looking", "Sure", "Just", "Also", "Here", "Back",
    "Still", "Currently", "Really", "Happy", "Glad", "Sorry", "Done", "Fine", "Good", "New",
    "Stuck", "Having", "Getting", "Using", "Thinking", "Wondering", "Hoping", "Ready", "Able",
    "In", "On", "At", "An", "As", "By", "Of", "To", "So", "Up", "No", "Out", "Off", "Over",
    "Away", "About", "Almost", "All", "Busy", "Afraid",
];

const VAGUE_PROJECTS: &[&str] = &[
    "it", "this", "that", "something", "stuff", "things", "a lot", "many things", "some stuff",
    "project",
];

const LANGUAGES: &[&str] = &[
    "sql", "t-sql", "pl/sql", "python", "rust", "java", "javascript", "typescript", "c#",
    "scala", "go", "r", "vba", "powershell",
];

const TOOLS: &[&str] = &[
    "excel", "ssms", "vscode", "vs code", "jupyter", "git", "docker", "postgres", "postgresql",
    "oracle", "snowflake", "dbeaver", "tableau", "power bi", "sapiens",
];

const STYLE_WORDS: &[&str] = &[
    "concise", "brief", "short", "detailed", "examples", "bullet", "step-by-step", "step by step",
];

/// Sentence candidates longer than this are cut.
const MAX_SENTENCE_CHARS: usize = 240;

/// A fact derived heuristically from a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactKind {
    FullName(String),
    Team(String),
    Project(String),
    StateWorked(String),
    ClassificationCode(String),
    TechPreference { key: String, value: String },
    Topic(String),
    Decision(String),
    ActionItem(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFact {
    pub kind: FactKind,
    /// Never above `EXTRACTION_CONFIDENCE_CAP`.
    pub confidence: u8,
}

impl CandidateFact {
    pub fn new(kind: FactKind, confidence: u8) -> Self {
        Self {
            kind,
            confidence: confidence.min(EXTRACTION_CONFIDENCE_CAP),
        }
    }

    /// The memory entry this fact is recorded as. Topics, decisions and
    /// action items are not recorded as entries.
    pub fn to_entry(&self, conversation_id: &ConversationId) -> Option<NewMemoryEntry> {
        let (category, key, value) = match &self.kind {
            FactKind::FullName(name) => (MemoryCategory::Employee, "full_name".to_string(), name),
            FactKind::Team(team) => (MemoryCategory::Team, "team".to_string(), team),
            FactKind::Project(name) => (MemoryCategory::Project, project_key(name), name),
            FactKind::StateWorked(code) => (
                MemoryCategory::Domain,
                format!("{}:{}", STATES_WORKED, code),
                code,
            ),
            FactKind::ClassificationCode(code) => (
                MemoryCategory::Domain,
                format!("{}:{}", CLASSIFICATION_CODES, code),
                code,
            ),
            FactKind::TechPreference { key, value } => {
                (MemoryCategory::Preference, key.clone(), value)
            }
            FactKind::Topic(_) | FactKind::Decision(_) | FactKind::ActionItem(_) => return None,
        };

        Some(
            NewMemoryEntry::new(category, &key, value, self.confidence)
                .with_source(conversation_id)
                .with_tags(&["extracted"]),
        )
    }
}

/// Entry key for a project: its name, trimmed and lowercased.
pub fn project_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Regex-driven extractor for user facts mentioned in passing.
pub struct HeuristicExtractor {
    name_patterns: Vec<Regex>,
    team_patterns: Vec<Regex>,
    project_patterns: Vec<Regex>,
    project_stop: Regex,
    state_code_pattern: Regex,
    state_name_pattern: Regex,
    class_code_patterns: Vec<Regex>,
    preference_pattern: Regex,
    topic_patterns: Vec<(Regex, &'static str)>,
    decision_patterns: Vec<Regex>,
    task_patterns: Vec<Regex>,
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicExtractor {
    pub fn new() -> Self {
        let mut names: Vec<&str> = US_STATES.iter().map(|(_, name)| *name).collect();
        // Longest first so "West Virginia" wins over "Virginia".
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));
        let state_names = names
            .iter()
            .map(|name| regex::escape(name))
            .collect::<Vec<_>>()
            .join("|");

        Self {
            name_patterns: vec![
                Regex::new(r"(?:\bI['’]m|\bI am|\b[Mm]y name is)\s+([A-Z][a-z][A-Za-z'\-]*(?:\s+[A-Z][a-z][A-Za-z'\-]*)?)").unwrap(),
            ],
            team_patterns: vec![
                // "I'm John from Data Conversion"
                Regex::new(r"(?:\bI['’]m|\bI am|\b[Mm]y name is)\s+[A-Z][a-z][A-Za-z'\-]*(?:\s+[A-Z][a-z][A-Za-z'\-]*)?\s+from\s+(?:the\s+)?([A-Z][A-Za-z&\-]*(?:\s+[A-Z][A-Za-z&\-]*)*)").unwrap(),
                // "on the Data Conversion team"
                Regex::new(r"\b(?:on|in|from|joined|with)\s+the\s+([A-Z][A-Za-z&\-]*(?:\s+[A-Z][A-Za-z&\-]*)*)\s+[Tt]eam\b").unwrap(),
            ],
            project_patterns: vec![
                Regex::new(r#"\b[Pp]roject\s+(?:called\s+|named\s+)?["“']([^"”'\n]{2,80})["”']"#).unwrap(),
                Regex::new(r"\b[Pp]roject\s+([A-Z][A-Za-z0-9_\-]*(?:\s+[A-Z0-9][A-Za-z0-9_\-]*)*)").unwrap(),
                Regex::new(r"\bthe\s+([A-Z][A-Za-z0-9_\-]*(?:\s+[A-Z0-9][A-Za-z0-9_\-]*)*)\s+project\b").unwrap(),
                Regex::new(r"(?i)\bworking on\s+(?:the\s+|a\s+|an\s+|our\s+|my\s+)?([^.,;:!?\n]+)").unwrap(),
            ],
            project_stop: Regex::new(r"(?i)\s+(?:and|but|because|since|so|which|that|today|tomorrow|right now|now|this week|at the moment)\b").unwrap(),
            state_code_pattern: Regex::new(r"\b([A-Z]{2})\b").unwrap(),
            state_name_pattern: Regex::new(&format!(r"(?i)\b({})\b", state_names)).unwrap(),
            class_code_patterns: vec![
                Regex::new(r"(?i)\b(?:class(?:ification)?(?:\s+codes?)?|codes?)\s*(?:#|no\.?)?\s*(\d{4})\b").unwrap(),
                Regex::new(r"\b(\d{4})\b").unwrap(),
            ],
            preference_pattern: Regex::new(r"(?i)\bI\s+(?:prefer|like using|usually use|tend to use|would rather use)\s+([^.,;!?\n]{1,60})").unwrap(),
            topic_patterns: vec![
                (Regex::new(r"(?i)\bpolic(?:y|ies)\b").unwrap(), "WC Policies"),
                (Regex::new(r"(?i)\bclass(?:ification)? codes?\b").unwrap(), "Class Codes"),
                (Regex::new(r"(?i)\brating\b").unwrap(), "Rating Algorithms"),
                (Regex::new(r"(?i)\bconver(?:sion|sions|t|ting)\b").unwrap(), "Data Conversion"),
                (Regex::new(r"(?i)\bmigrat(?:e|ion|ions|ing)\b").unwrap(), "Data Migration"),
                (Regex::new(r"(?i)\bsapiens\b").unwrap(), "Sapiens CourseSuite"),
                (Regex::new(r"(?i)\bpremiums?\b").unwrap(), "Premium Calculation"),
                (Regex::new(r"(?i)\bclaims?\b").unwrap(), "Claims"),
                (Regex::new(r"(?i)\bendorsements?\b").unwrap(), "Endorsements"),
                (Regex::new(r"(?i)\bstates?\b").unwrap(), "State Requirements"),
                (Regex::new(r"(?i)\breport(?:s|ing)?\b").unwrap(), "Reporting"),
                (Regex::new(r"(?i)\btest(?:s|ing)?\b").unwrap(), "Testing"),
                (Regex::new(r"(?i)\bsql\b").unwrap(), "SQL Queries"),
                (Regex::new(r"(?i)\bapis?\b").unwrap(), "API Integration"),
            ],
            decision_patterns: vec![
                Regex::new(r"(?i)\b(decided|chose|selected|picked|opted)\s+to\b").unwrap(),
                Regex::new(r"(?i)\b(will|going to|plan to|planning to)\s+(?:use|adopt|implement|switch to|move to)\b").unwrap(),
                Regex::new(r"(?i)\b(we agreed|agreed to|the decision is)\b").unwrap(),
            ],
            task_patterns: vec![
                Regex::new(r"(?i)\b(TODO|FIXME|action item)\s*[:\-]?\s*\S").unwrap(),
                Regex::new(r"(?i)\b(need to|have to|must|remember to|don't forget to)\s+[a-z]").unwrap(),
                Regex::new(r"(?i)\b(next step|next up)\b.*[:\-]\s*\S").unwrap(),
            ],
        }
    }

    /// Extract every candidate fact from one message. Duplicates are dropped.
    pub fn extract(&self, text: &str) -> Vec<CandidateFact> {
        let mut facts = Vec::new();

        facts.extend(self.extract_name(text));
        facts.extend(self.extract_team(text));
        facts.extend(self.extract_projects(text));
        facts.extend(self.extract_states(text));
        facts.extend(self.extract_class_codes(text));
        facts.extend(self.extract_preference(text));
        facts.extend(self.extract_topic(text));
        facts.extend(self.extract_decisions(text));
        facts.extend(self.extract_tasks(text));

        let mut unique: Vec<CandidateFact> = Vec::with_capacity(facts.len());
        for fact in facts {
            if !unique.iter().any(|f| f.kind == fact.kind) {
                unique.push(fact);
            }
        }

        debug!(candidates = unique.len(), "Heuristic extraction finished");
        unique
    }

    /// Best-matching frequent topic for a message, if any keyword hits.
    pub fn topic_for(&self, text: &str) -> Option<&'static str> {
        self.topic_patterns
            .iter()
            .find(|(pattern, _)| pattern.is_match(text))
            .map(|(_, topic)| *topic)
    }

    fn extract_name(&self, text: &str) -> Option<CandidateFact> {
        for pattern in &self.name_patterns {
            for caps in pattern.captures_iter(text) {
                let name = caps[1].trim();
                let first = name.split_whitespace().next().unwrap_or(name);
                if NOT_NAMES.contains(&first) {
                    continue;
                }
                return Some(CandidateFact::new(FactKind::FullName(name.to_string()), 65));
            }
        }
        None
    }

    fn extract_team(&self, text: &str) -> Option<CandidateFact> {
        for (index, pattern) in self.team_patterns.iter().enumerate() {
            if let Some(caps) = pattern.captures(text) {
                let team = strip_suffix_word(caps[1].trim(), "team");
                if team.is_empty() || is_state_code(team) || state_code_for_name(team).is_some() {
                    continue;
                }
                let confidence = if index == 0 { 60 } else { 65 };
                return Some(CandidateFact::new(FactKind::Team(team.to_string()), confidence));
            }
        }
        None
    }

    fn extract_projects(&self, text: &str) -> Vec<CandidateFact> {
        let mut projects = Vec::new();
        for (index, pattern) in self.project_patterns.iter().enumerate() {
            for caps in pattern.captures_iter(text) {
                let raw = caps[1].trim();
                // Free-form phrases end at the first connective.
                let name = match self.project_stop.find(raw) {
                    Some(stop) => raw[..stop.start()].trim(),
                    None => raw,
                };
                // "project Phoenix" and "the Rating Engine project" name the
                // same project as the structured patterns.
                let name = strip_suffix_word(strip_prefix_word(name, "project"), "project");
                let name: String = name
                    .split_whitespace()
                    .take(8)
                    .collect::<Vec<_>>()
                    .join(" ");
                let lower = name.to_lowercase();
                if name.chars().count() < 3 || VAGUE_PROJECTS.contains(&lower.as_str()) {
                    continue;
                }
                let confidence = match index {
                    0 => 70,
                    1 | 2 => 55,
                    _ => 60,
                };
                push_project(&mut projects, name, confidence);
            }
        }
        projects
    }

    fn extract_states(&self, text: &str) -> Vec<CandidateFact> {
        let mut states = Vec::new();

        for caps in self.state_code_pattern.captures_iter(text) {
            let code = &caps[1];
            if is_state_code(code) && !AMBIGUOUS_CODES.contains(&code) {
                states.push(CandidateFact::new(FactKind::StateWorked(code.to_string()), 55));
            }
        }

        for caps in self.state_name_pattern.captures_iter(text) {
            if let Some(code) = state_code_for_name(&caps[1]) {
                states.push(CandidateFact::new(FactKind::StateWorked(code.to_string()), 60));
            }
        }

        states
    }

    fn extract_class_codes(&self, text: &str) -> Vec<CandidateFact> {
        let mut codes = Vec::new();

        for caps in self.class_code_patterns[0].captures_iter(text) {
            codes.push(CandidateFact::new(
                FactKind::ClassificationCode(caps[1].to_string()),
                65,
            ));
        }

        for caps in self.class_code_patterns[1].captures_iter(text) {
            let Some(m) = caps.get(1) else { continue };
            let code = m.as_str();
            if looks_like_year(code) || follows_amount_sign(text, m.start()) {
                continue;
            }
            codes.push(CandidateFact::new(
                FactKind::ClassificationCode(code.to_string()),
                45,
            ));
        }

        codes
    }

    fn extract_preference(&self, text: &str) -> Option<CandidateFact> {
        let caps = self.preference_pattern.captures(text)?;
        let phrase = caps[1].trim();
        let lower = phrase.to_lowercase();
        let first = lower.split_whitespace().next()?;

        let (key, value) = if LANGUAGES.contains(&first) {
            ("preferred_language", first_word(phrase))
        } else if let Some(tool) = TOOLS.iter().find(|tool| lower.starts_with(*tool)) {
            ("preferred_tool", phrase.get(..tool.len()).unwrap_or(*tool).to_string())
        } else if STYLE_WORDS.iter().any(|word| lower.contains(word)) {
            ("response_style", phrase.to_string())
        } else {
            return None;
        };

        Some(CandidateFact::new(
            FactKind::TechPreference {
                key: key.to_string(),
                value,
            },
            50,
        ))
    }

    fn extract_topic(&self, text: &str) -> Option<CandidateFact> {
        self.topic_for(text)
            .map(|topic| CandidateFact::new(FactKind::Topic(topic.to_string()), 50))
    }

    fn extract_decisions(&self, text: &str) -> Vec<CandidateFact> {
        let mut decisions = Vec::new();
        for pattern in &self.decision_patterns {
            for m in pattern.find_iter(text) {
                let sentence = sentence_at(text, m.start());
                if !sentence.is_empty() {
                    decisions.push(CandidateFact::new(FactKind::Decision(sentence), 60));
                }
            }
        }
        decisions
    }

    fn extract_tasks(&self, text: &str) -> Vec<CandidateFact> {
        let mut tasks = Vec::new();
        for pattern in &self.task_patterns {
            for m in pattern.find_iter(text) {
                let sentence = sentence_at(text, m.start());
                if !sentence.is_empty() {
                    tasks.push(CandidateFact::new(FactKind::ActionItem(sentence), 60));
                }
            }
        }
        tasks
    }
}

fn is_state_code(code: &str) -> bool {
    US_STATES.iter().any(|(c, _)| *c == code)
}

fn state_code_for_name(name: &str) -> Option<&'static str> {
    US_STATES
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name.trim()))
        .map(|(code, _)| *code)
}

fn looks_like_year(code: &str) -> bool {
    matches!(code.parse::<u32>(), Ok(year) if (1900..=2099).contains(&year))
}

fn follows_amount_sign(text: &str, start: usize) -> bool {
    text[..start]
        .chars()
        .next_back()
        .map(|c| c == '$' || c == '.' || c == ',')
        .unwrap_or(false)
}

fn first_word(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .next()
        .unwrap_or(phrase)
        .to_string()
}

fn strip_prefix_word<'a>(phrase: &'a str, word: &str) -> &'a str {
    match phrase.split_once(char::is_whitespace) {
        Some((first, rest)) if first.eq_ignore_ascii_case(word) => rest.trim_start(),
        _ => phrase,
    }
}

/// One candidate per `project_key`, at the highest confidence seen.
fn push_project(projects: &mut Vec<CandidateFact>, name: String, confidence: u8) {
    let key = project_key(&name);
    let existing = projects.iter_mut().find(|fact| match &fact.kind {
        FactKind::Project(other) => project_key(other) == key,
        _ => false,
    });
    match existing {
        Some(fact) => fact.confidence = fact.confidence.max(confidence),
        None => projects.push(CandidateFact::new(FactKind::Project(name), confidence)),
    }
}

fn strip_suffix_word<'a>(phrase: &'a str, word: &str) -> &'a str {
    match phrase.rsplit_once(char::is_whitespace) {
        Some((head, last)) if last.eq_ignore_ascii_case(word) => head.trim_end(),
        _ => phrase,
    }
}

/// The sentence containing byte offset `position`.
fn sentence_at(text: &str, position: usize) -> String {
    let is_boundary = |c: char| c == '.' || c == '!' || c == '?' || c == '\n';

    let start = text[..position]
        .rfind(is_boundary)
        .map(|p| p + 1)
        .unwrap_or(0);
    let end = text[position..]
        .find(is_boundary)
        .map(|p| position + p)
        .unwrap_or(text.len());

    text[start..end]
        .trim()
        .chars()
        .take(MAX_SENTENCE_CHARS)
        .collect()
}
