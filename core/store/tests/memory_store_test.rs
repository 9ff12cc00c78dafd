use std::sync::Arc;
use tempfile::NamedTempFile;
use user_memory_schemas::{
    ContextContribution, ConversationId, EmployeeFacts, EntryFilter, EntryWrite, InboundMessage,
    MemoryCategory, NewMemoryEntry, ProjectStatus, ProjectUpdate, UserId, STATES_WORKED,
};
use user_memory_store::{MemoryLimits, MemoryStore, MessageIngestor};

fn open_store(limits: MemoryLimits) -> (NamedTempFile, Arc<MemoryStore>) {
    let temp = NamedTempFile::new().unwrap();
    let store = Arc::new(MemoryStore::open(temp.path(), limits).unwrap());
    (temp, store)
}

fn register(store: &MemoryStore, id: &str) -> UserId {
    let user_id = UserId::from(id);
    store.register_user(&user_id).unwrap();
    user_id
}

fn message(user_id: &UserId, conversation: &str, content: &str) -> InboundMessage {
    InboundMessage {
        user_id: user_id.clone(),
        conversation_id: ConversationId::from(conversation),
        content: content.to_string(),
        context_key: None,
        received_at: "2024-01-10T12:00:00+00:00".to_string(),
    }
}

#[test]
fn test_concurrent_get_or_create_yields_one_memory() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");

    let ids: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| store.get_or_create(&user_id).unwrap().id.0))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(store.snapshot(&user_id).unwrap().id.0, ids[0]);
}

#[test]
fn test_concurrent_writes_for_one_user_are_not_lost() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");
    let other = register(&store, "emp-2");

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..10 {
                    store.record_interaction(&user_id).unwrap();
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..10 {
                store.record_interaction(&other).unwrap();
            }
        });
    });

    assert_eq!(store.snapshot(&user_id).unwrap().stats.total_messages, 40);
    assert_eq!(store.snapshot(&other).unwrap().stats.total_messages, 10);
}

#[test]
fn test_summaries_keep_most_recent_fifty() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");

    for i in 1..=51 {
        store
            .add_conversation_summary(&user_id, &format!("topic-{:03}", i), "resolved")
            .unwrap();
    }

    let memory = store.snapshot(&user_id).unwrap();
    assert_eq!(memory.conversation_summaries.len(), 50);
    assert_eq!(memory.conversation_summaries[0].topic, "topic-002");
    assert_eq!(memory.conversation_summaries[49].topic, "topic-051");
}

#[test]
fn test_active_projects_bounded_with_overflow_in_history() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");

    for i in 1..=25 {
        let update = ProjectUpdate {
            name: format!("project-{:02}", i),
            status: Some(ProjectStatus::InProgress),
            description: None,
        };
        store.add_active_project(&user_id, &update).unwrap();
    }

    let memory = store.snapshot(&user_id).unwrap();
    assert_eq!(memory.active_projects.len(), 20);
    assert_eq!(memory.active_projects[0].name, "project-06");
    assert_eq!(memory.active_projects[19].name, "project-25");
    assert_eq!(memory.project_history.len(), 5);
    assert!(memory
        .project_history
        .iter()
        .all(|p| p.status == ProjectStatus::Done));

    let completed = store
        .complete_project(&user_id, "PROJECT-25", Some("shipped".into()))
        .unwrap();
    assert_eq!(completed.active_projects.len(), 19);
    assert_eq!(
        completed.project_history.last().unwrap().outcome.as_deref(),
        Some("shipped")
    );
    assert!(store
        .complete_project(&user_id, "project-25", None)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_entry_confidence_rule() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");

    let first = NewMemoryEntry::new(MemoryCategory::Domain, "favorite_state", "CA", 60);
    let recorded = store.record_memory_entry(&user_id, &first).unwrap();
    assert_eq!(recorded.write, EntryWrite::Inserted);

    let stronger = NewMemoryEntry::new(MemoryCategory::Domain, "favorite_state", "NY", 80);
    let recorded = store.record_memory_entry(&user_id, &stronger).unwrap();
    assert_eq!(recorded.write, EntryWrite::Updated);
    assert_eq!(recorded.entry.value, "NY");

    let weaker = NewMemoryEntry::new(MemoryCategory::Domain, "favorite_state", "TX", 50);
    let recorded = store.record_memory_entry(&user_id, &weaker).unwrap();
    assert_eq!(recorded.write, EntryWrite::Kept);
    assert_eq!(recorded.entry.value, "NY");
    assert_eq!(recorded.entry.confidence, 80);

    let tie = NewMemoryEntry::new(MemoryCategory::Domain, "favorite_state", "FL", 80);
    assert_eq!(
        store.record_memory_entry(&user_id, &tie).unwrap().write,
        EntryWrite::Updated
    );
}

#[test]
fn test_employee_facts_upsert_is_idempotent() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");
    let facts = EmployeeFacts {
        full_name: Some("John Smith".into()),
        title: Some("Data Analyst".into()),
        ..Default::default()
    };

    let once = store.upsert_employee_facts(&user_id, facts.clone()).unwrap();
    let entries_once = store
        .list_memory_entries(&user_id, &EntryFilter::default())
        .unwrap();
    let twice = store.upsert_employee_facts(&user_id, facts).unwrap();
    let entries_twice = store
        .list_memory_entries(&user_id, &EntryFilter::default())
        .unwrap();

    assert_eq!(once.employee_facts, twice.employee_facts);
    assert_eq!(entries_once.len(), 2);
    assert_eq!(entries_twice.len(), 2);
    let values = |entries: &[user_memory_schemas::MemoryEntry]| {
        entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(values(&entries_once), values(&entries_twice));
}

#[test]
fn test_introduction_message_populates_memory() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");
    let ingestor = MessageIngestor::new(store.clone());

    ingestor
        .ingest(&message(
            &user_id,
            "conv_1",
            "I'm John from Data Conversion working on CA WC migration",
        ))
        .unwrap();

    let memory = store.snapshot(&user_id).unwrap();
    assert_eq!(memory.employee_facts.full_name.as_deref(), Some("John"));
    assert_eq!(memory.team_info.team.as_deref(), Some("Data Conversion"));
    assert!(memory.find_active_project("CA WC migration").is_some());
    assert!(memory.domain_expertise.contains(STATES_WORKED, "CA"));

    let extracted = store
        .list_memory_entries(
            &user_id,
            &EntryFilter {
                category: None,
                tag: Some("extracted".into()),
            },
        )
        .unwrap();
    assert!(extracted
        .iter()
        .all(|e| e.confidence <= 70
            && e.source_conversation_id == Some(ConversationId::from("conv_1"))));
}

#[test]
fn test_extraction_never_overrides_explicit_facts() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");
    let ingestor = MessageIngestor::new(store.clone());

    store
        .upsert_employee_facts(
            &user_id,
            EmployeeFacts {
                full_name: Some("John Smith".into()),
                ..Default::default()
            },
        )
        .unwrap();

    let report = ingestor
        .ingest(&message(&user_id, "conv_2", "I'm Jon from Claims"))
        .unwrap();
    assert!(report.outcome.kept >= 1);

    let memory = store.snapshot(&user_id).unwrap();
    assert_eq!(memory.employee_facts.full_name.as_deref(), Some("John Smith"));
    assert_eq!(memory.team_info.team.as_deref(), Some("Claims"));
}

#[test]
fn test_context_spans_conversations() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let user_id = register(&store, "emp-1");
    let first = ConversationId::from("conv_a");
    let second = ConversationId::from("conv_b");

    store
        .append_to_context(
            &user_id,
            "WC_MIGRATION_2024",
            &first,
            ContextContribution {
                key_facts: vec!["Source system is the 2019 policy admin".into()],
                ..Default::default()
            },
        )
        .unwrap();
    store
        .append_to_context(
            &user_id,
            "WC_MIGRATION_2024",
            &second,
            ContextContribution {
                decisions: vec!["Convert CA before NY".into()],
                ..Default::default()
            },
        )
        .unwrap();
    let context = store
        .append_to_context(
            &user_id,
            "WC_MIGRATION_2024",
            &first,
            ContextContribution::default(),
        )
        .unwrap();

    assert_eq!(context.conversation_ids, vec![first, second]);
    assert_eq!(context.key_facts.len(), 1);
    assert_eq!(context.decisions, vec!["Convert CA before NY".to_string()]);

    let listed = store.list_contexts(&user_id).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].context_key, "WC_MIGRATION_2024");
}

#[test]
fn test_users_are_isolated() {
    let (_temp, store) = open_store(MemoryLimits::default());
    let alice = register(&store, "alice");
    let bob = register(&store, "bob");

    store
        .add_conversation_summary(&alice, "Class codes", "Mapped 8810")
        .unwrap();
    store
        .get_or_create_context(&alice, "ALICE_ONLY", None, None)
        .unwrap();

    let memory = store.snapshot(&bob).unwrap();
    assert!(memory.conversation_summaries.is_empty());
    assert!(store.get_context(&bob, "ALICE_ONLY").unwrap().is_none());
    assert!(store.list_contexts(&bob).unwrap().is_empty());
}
