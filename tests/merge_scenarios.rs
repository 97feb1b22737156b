use schema_vcs::{
    ChangeEvent, CommitOutcome, ConflictKind, EntityKind, MemoryStore, MergeOptions, MergeOutcome,
    ObjectStore, QualifiedName, Repository, ResolutionState, ResolutionStrategy, Resolutions, Session,
    SnapshotRef, VcsConfig, VcsError,
};
use serde_json::{json, Value};
use std::sync::Arc;

// Small fixture around a repository with `main` and a `feature` branch
struct Fixture {
    repo: Arc<Repository>,
    main: Session,
}

impl Fixture {
    fn new() -> Self {
        let repo = Repository::init(MemoryStore::new(), VcsConfig::in_memory()).unwrap();
        let main = repo.default_session().unwrap();
        Self { repo, main }
    }

    fn feature(&self) -> Session {
        if self.repo.get_branch("feature").is_err() {
            self.main.create_branch("feature").unwrap();
        }
        self.repo.session("feature").unwrap()
    }

    fn tree(&self, branch: &str) -> Vec<(String, String)> {
        self.repo
            .checkout_tree(branch)
            .unwrap()
            .entries()
            .iter()
            .map(|(name, hash)| (name.to_string(), hash.to_string()))
            .collect()
    }
}

fn qn(raw: &str) -> QualifiedName {
    QualifiedName::parse(raw).unwrap()
}

fn table(columns: &[&str]) -> Value {
    let columns: Vec<Value> = columns
        .iter()
        .map(|c| json!({"name": c, "type": "text", "nullable": true}))
        .collect();
    json!({ "columns": columns })
}

fn record(session: &Session, events: Vec<ChangeEvent>, message: &str) {
    let outcome = session.apply_events(&events, "tester", message).unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { .. }));
}

#[test]
fn test_clean_merge_combines_both_sides() {
    let fx = Fixture::new();
    record(
        &fx.main,
        vec![ChangeEvent::created(qn("public.t1"), EntityKind::Table, table(&["id"]))],
        "t1",
    );
    let feature = fx.feature();
    record(
        &feature,
        vec![ChangeEvent::created(qn("public.t2"), EntityKind::Table, table(&["id"]))],
        "t2",
    );
    // keep main moving so this is a true three-way merge
    record(
        &fx.main,
        vec![ChangeEvent::created(qn("public.t3"), EntityKind::Table, table(&["id"]))],
        "t3",
    );

    let outcome = fx.main.merge("feature", MergeOptions::default()).unwrap();
    let MergeOutcome::Merged {
        commit_id, resolved, ..
    } = outcome
    else {
        panic!("expected a merge commit");
    };
    assert!(resolved.is_empty());

    let names: Vec<String> = fx.tree("main").into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["public.t1", "public.t2", "public.t3"]);

    let merge_commit = fx.repo.get_commit(&commit_id).unwrap();
    assert!(merge_commit.is_merge());
    assert_eq!(
        merge_commit.parent_ids()[1],
        fx.repo.get_branch("feature").unwrap().head_commit_id
    );
}

#[test]
fn test_linear_history_fast_forwards() {
    let fx = Fixture::new();
    let feature = fx.feature();
    record(
        &feature,
        vec![ChangeEvent::created(qn("public.t2"), EntityKind::Table, table(&["id"]))],
        "t2",
    );
    let from = fx.main.head().unwrap();
    let to = feature.head().unwrap();

    let outcome = fx.main.merge("feature", MergeOptions::default()).unwrap();
    assert_eq!(outcome, MergeOutcome::FastForward { from, to: to.clone() });
    assert_eq!(fx.main.head().unwrap(), to);
}

#[test]
fn test_true_conflict_blocks_commit_until_resolved() {
    let fx = Fixture::new();
    record(
        &fx.main,
        vec![ChangeEvent::created(qn("public.t1"), EntityKind::Table, table(&["id"]))],
        "t1",
    );
    let feature = fx.feature();
    record(
        &fx.main,
        vec![ChangeEvent::altered(
            qn("public.t1"),
            EntityKind::Table,
            table(&["id"]),
            table(&["id", "a"]),
        )],
        "h1a",
    );
    record(
        &feature,
        vec![ChangeEvent::altered(
            qn("public.t1"),
            EntityKind::Table,
            table(&["id"]),
            table(&["id", "b"]),
        )],
        "h1b",
    );
    let main_head = fx.main.head().unwrap();
    let commits_before = fx.repo.log(&SnapshotRef::branch("main"), None).unwrap().len();

    let outcome = fx.main.merge("feature", MergeOptions::default()).unwrap();
    let MergeOutcome::Conflicted(pending) = outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(pending.conflicts.len(), 1);
    assert_eq!(pending.conflicts[0].kind, ConflictKind::BothModified);
    assert_eq!(pending.conflicts[0].resolution, ResolutionState::Unresolved);
    assert_eq!(fx.main.head().unwrap(), main_head);
    assert_eq!(
        fx.repo.log(&SnapshotRef::branch("main"), None).unwrap().len(),
        commits_before
    );

    // completing with nothing to resolve the conflict is refused
    let err = fx
        .main
        .complete_merge(&pending, &Resolutions::new(), &MergeOptions::default())
        .unwrap_err();
    assert!(matches!(err, VcsError::UnresolvedConflicts { remaining: 1, .. }));

    let outcome = fx
        .main
        .complete_merge(
            &pending,
            &Resolutions::new().with(
                qn("public.t1"),
                ResolutionStrategy::Manual {
                    definition: Some(table(&["id", "a", "b"])),
                },
            ),
            &MergeOptions::default(),
        )
        .unwrap();
    let MergeOutcome::Merged { resolved, .. } = outcome else {
        panic!("expected a merge commit");
    };
    assert_eq!(resolved[0].resolution, ResolutionState::Manual);
}

#[test]
fn test_delete_versus_modify() {
    let fx = Fixture::new();
    record(
        &fx.main,
        vec![ChangeEvent::created(qn("public.t1"), EntityKind::Table, table(&["id"]))],
        "t1",
    );
    let feature = fx.feature();
    record(
        &fx.main,
        vec![ChangeEvent::dropped(qn("public.t1"), EntityKind::Table, table(&["id"]))],
        "drop t1",
    );
    record(
        &feature,
        vec![ChangeEvent::altered(
            qn("public.t1"),
            EntityKind::Table,
            table(&["id"]),
            table(&["id", "x"]),
        )],
        "modify t1",
    );

    let outcome = fx.main.merge("feature", MergeOptions::default()).unwrap();
    let MergeOutcome::Conflicted(pending) = outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(pending.conflicts[0].kind, ConflictKind::DeletedVsModified);
    assert!(pending.conflicts[0].ours_hash.is_none());
}

#[test]
fn test_strategy_in_options_resolves_in_one_call() {
    let fx = Fixture::new();
    record(
        &fx.main,
        vec![ChangeEvent::created(qn("public.t1"), EntityKind::Table, table(&["id"]))],
        "t1",
    );
    let feature = fx.feature();
    record(
        &fx.main,
        vec![ChangeEvent::altered(
            qn("public.t1"),
            EntityKind::Table,
            table(&["id"]),
            table(&["id", "a"]),
        )],
        "ours",
    );
    record(
        &feature,
        vec![ChangeEvent::altered(
            qn("public.t1"),
            EntityKind::Table,
            table(&["id"]),
            table(&["id", "b"]),
        )],
        "theirs",
    );
    let theirs_tree = fx.tree("feature");

    let outcome = fx
        .main
        .merge(
            "feature",
            MergeOptions::with_resolutions(Resolutions::all(ResolutionStrategy::TheirsWins)),
        )
        .unwrap();
    assert!(matches!(outcome, MergeOutcome::Merged { .. }));
    assert_eq!(fx.tree("main"), theirs_tree);
}

#[test]
fn test_merge_is_idempotent() {
    let fx = Fixture::new();
    let feature = fx.feature();
    record(
        &fx.main,
        vec![ChangeEvent::created(qn("public.t1"), EntityKind::Table, table(&["id"]))],
        "t1",
    );

    // merging a branch into itself
    let head = fx.main.head().unwrap();
    assert_eq!(
        fx.main.merge("main", MergeOptions::default()).unwrap(),
        MergeOutcome::AlreadyMerged { head: head.clone() }
    );
    // merging an ancestor
    assert_eq!(
        fx.main.merge("feature", MergeOptions::default()).unwrap(),
        MergeOutcome::AlreadyMerged { head }
    );
    drop(feature);
}

#[test]
fn test_add_add_divergent() {
    let fx = Fixture::new();
    let feature = fx.feature();
    record(
        &fx.main,
        vec![ChangeEvent::created(
            qn("public.mood"),
            EntityKind::Type,
            json!({"values": ["happy"]}),
        )],
        "ours",
    );
    record(
        &feature,
        vec![ChangeEvent::created(
            qn("public.mood"),
            EntityKind::Type,
            json!({"values": ["sad"]}),
        )],
        "theirs",
    );

    let outcome = fx.main.merge("feature", MergeOptions::default()).unwrap();
    let MergeOutcome::Conflicted(pending) = outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(pending.conflicts[0].kind, ConflictKind::AddAddDivergent);
    assert!(pending.conflicts[0].base_hash.is_none());
}

#[test]
fn test_merge_uses_the_lowest_common_ancestor() {
    let fx = Fixture::new();
    let root = fx.main.head().unwrap();
    record(
        &fx.main,
        vec![ChangeEvent::created(qn("s.t1"), EntityKind::Table, table(&["id"]))],
        "t1",
    );
    fx.main.create_branch("side").unwrap();
    fx.repo.create_branch("old", &root).unwrap();

    for i in 0..8 {
        record(
            &fx.main,
            vec![ChangeEvent::created(qn(&format!("s.m{}", i)), EntityKind::Table, table(&["id"]))],
            "main work",
        );
    }
    record(
        &fx.main,
        vec![ChangeEvent::altered(
            qn("s.t1"),
            EntityKind::Table,
            table(&["id"]),
            table(&["id", "email"]),
        )],
        "widen t1",
    );

    let side = fx.repo.session("side").unwrap();
    for i in 0..4 {
        record(
            &side,
            vec![ChangeEvent::created(qn(&format!("s.side{}", i)), EntityKind::Table, table(&["id"]))],
            "side work",
        );
    }
    let old = fx.repo.session("old").unwrap();
    record(
        &old,
        vec![ChangeEvent::created(qn("s.old"), EntityKind::Table, table(&["id"]))],
        "old work",
    );
    assert!(matches!(
        old.merge("side", MergeOptions::default()).unwrap(),
        MergeOutcome::Merged { .. }
    ));

    // only main touched s.t1 since the fork, so nothing conflicts
    let outcome = fx.main.merge("old", MergeOptions::default()).unwrap();
    let MergeOutcome::Merged { resolved, .. } = outcome else {
        panic!("expected a clean merge");
    };
    assert!(resolved.is_empty());
    let tree = fx.repo.checkout_tree("main").unwrap();
    let widened = fx.repo.put_entity(EntityKind::Table, &table(&["id", "email"])).unwrap();
    assert_eq!(tree.get(&qn("s.t1")), Some(&widened));
    assert!(tree.contains(&qn("s.old")));
    assert!(tree.contains(&qn("s.side3")));
}

#[test]
fn test_disconnected_histories_fail_with_integrity_error() {
    let fx = Fixture::new();
    let store = fx.repo.store();
    let tree = fx
        .repo
        .put_tree(schema_vcs::Tree::new().with_entry(
            qn("public.orphan"),
            fx.repo
                .put_entity(EntityKind::Table, &table(&["id"]))
                .unwrap(),
        ))
        .unwrap();
    let orphan_root = fx.repo.commit(&tree, vec![], "tester", "orphan").unwrap();
    fx.repo.create_branch("orphan", &orphan_root).unwrap();
    assert!(store.object_count().unwrap() > 0);

    let err = fx.main.merge("orphan", MergeOptions::default()).unwrap_err();
    assert!(matches!(err, VcsError::NoCommonAncestor { .. }));
    assert!(err.is_integrity());
}

