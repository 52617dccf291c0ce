use doc_hub_core::acl::{Ace, Right, Rights};
use doc_hub_core::auth::{DatabaseDirectory, Subject, SubjectDirectory, ADMINS_ID, ADMINS_NAME, USERS_ID};
use doc_hub_core::authz::{access_filter_for, build_access_filter, has_authorization, normalize_acl};
use doc_hub_core::db::{Database, MemoryDatabase};
use doc_hub_core::filter::{Filter, UpdateSpec};
use doc_hub_core::transport::{Message, Reassembler};
use doc_hub_core::{Document, DocumentStore, StoreConfig};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;

const PRINCIPALS: [&str; 6] = ["alice", "bob", "editors", "viewers", USERS_ID, "nobody"];

fn random_rights(rng: &mut StdRng) -> Rights {
    if rng.gen_bool(0.1) {
        Rights::FULL_CONTROL
    } else {
        Rights::from_bits(rng.gen_range(0..32))
    }
}

fn random_acl(rng: &mut StdRng) -> Vec<Ace> {
    (0..rng.gen_range(0..8))
        .map(|_| {
            let who = *PRINCIPALS.choose(rng).unwrap_or(&"alice");
            let rights = random_rights(rng);
            if rng.gen_bool(0.25) {
                Ace::deny(who, "", rights)
            } else {
                Ace::allow(who, who, rights)
            }
        })
        .collect()
}

fn subjects() -> Vec<Subject> {
    vec![
        Subject::new("alice", "alice").with_role("editors", "editors"),
        Subject::new("bob", "bob").with_role("viewers", "viewers").with_role(USERS_ID, "users"),
        Subject::new("carol", "carol"),
        Subject::new("x", "x").with_role(ADMINS_ID, ADMINS_NAME),
    ]
}

#[tokio::test]
async fn normalizing_twice_changes_nothing() {
    let db = Arc::new(MemoryDatabase::new());
    for (id, name, kind) in [("bob", "Bob", "user"), ("editors", "Editors", "role"), ("viewers", "Viewers", "role")] {
        db.insert_one("users", Document::from_value(json!({"_id": id, "name": name, "_type": kind})).unwrap())
            .await
            .unwrap();
    }
    let directory = DatabaseDirectory::new(db, "users");
    let mut rng = StdRng::seed_from_u64(7);
    let configs = [
        StoreConfig::default(),
        StoreConfig {
            allow_merge_acl: false,
            force_add_admins: false,
            max_ace_count: 16,
            ..Default::default()
        },
        StoreConfig {
            max_ace_count: 2,
            ..Default::default()
        },
    ];
    for _ in 0..200 {
        let config = &configs[rng.gen_range(0..configs.len())];
        let actors = subjects();
        let actor = &actors[rng.gen_range(0..actors.len())];
        let mut once = Document::new();
        once.set_id(format!("doc-{}", rng.gen::<u16>()));
        once.set_acl(&random_acl(&mut rng));
        normalize_acl(&mut once, actor, config, Some(&directory as &dyn SubjectDirectory)).await.unwrap();
        let mut twice = once.clone();
        normalize_acl(&mut twice, actor, config, Some(&directory as &dyn SubjectDirectory)).await.unwrap();
        assert_eq!(once.acl(), twice.acl());
        assert!(once.acl().iter().all(|a| !a.rights.is_none()));
        if config.force_add_admins {
            assert!(once.acl().iter().any(|a| a.subject_id == ADMINS_ID && !a.deny));
        }
    }
}

#[tokio::test]
async fn capped_acl_keeps_the_role_that_grants_the_actor() {
    let db = Arc::new(MemoryDatabase::new());
    for (id, name, kind) in [("a1", "A1", "user"), ("a2", "A2", "user"), ("r", "R", "role")] {
        db.insert_one("users", Document::from_value(json!({"_id": id, "name": name, "_type": kind})).unwrap())
            .await
            .unwrap();
    }
    let directory = DatabaseDirectory::new(db, "users");
    let config = StoreConfig {
        max_ace_count: 2,
        ..Default::default()
    };
    let actor = Subject::new("u", "u").with_role("r", "r");
    for role_last in [false, true] {
        let mut acl = vec![
            Ace::allow("a1", "a1", Rights::of(&[Right::Read])),
            Ace::allow("a2", "a2", Rights::of(&[Right::Read])),
        ];
        let role = Ace::allow("r", "r", Rights::FULL_CONTROL);
        if role_last {
            acl.push(role);
        } else {
            acl.insert(0, role);
        }
        let mut once = Document::new();
        once.set_id("d1");
        once.set_acl(&acl);
        normalize_acl(&mut once, &actor, &config, Some(&directory as &dyn SubjectDirectory)).await.unwrap();
        assert!(has_authorization(&actor, &once, Right::Read));
        assert!(has_authorization(&actor, &once, Right::Update));
        assert!(once.acl().iter().all(|a| a.subject_id != "u"), "{:?}", once.acl());

        let mut twice = once.clone();
        normalize_acl(&mut twice, &actor, &config, Some(&directory as &dyn SubjectDirectory)).await.unwrap();
        assert_eq!(once.acl(), twice.acl());
    }
}

#[test]
fn access_filters_agree_with_point_checks() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..500 {
        let mut doc = Document::new();
        let id = if rng.gen_bool(0.1) { "alice".to_string() } else { format!("d{}", rng.gen::<u16>()) };
        doc.set_id(id);
        doc.set_acl(&random_acl(&mut rng));
        for subject in subjects() {
            for right in Right::ALL {
                let allowed = has_authorization(&subject, &doc, right);
                assert_eq!(
                    access_filter_for(&subject, right).matches(&doc),
                    allowed,
                    "{} {right} {:?}",
                    subject.id,
                    doc.acl()
                );
            }
            let pair = Rights::of(&[Right::Read, Right::Update]);
            if build_access_filter(&subject, pair).matches(&doc) {
                assert!(has_authorization(&subject, &doc, Right::Read));
                assert!(has_authorization(&subject, &doc, Right::Update));
            }
        }
    }
}

#[tokio::test]
async fn history_rebuilds_every_version() {
    let db = Arc::new(MemoryDatabase::new());
    let store = DocumentStore::new(
        db,
        StoreConfig {
            history_delta_count: 4,
            ..Default::default()
        },
    );
    let owner = Subject::new("owner", "owner");
    let mut rng = StdRng::seed_from_u64(3);
    let first = store
        .insert_one(&owner, "notes", Document::from_value(json!({"_type": "note", "n": 0, "tags": []})).unwrap())
        .await
        .unwrap();
    let id = first.id().unwrap().to_string();
    let mut states = vec![first];

    while states.len() < 20 {
        let current = states.last().cloned().unwrap();
        let next = match rng.gen_range(0..3) {
            0 => {
                let mut replacement = current.clone();
                let tags: Vec<u32> = (0..rng.gen_range(0..4)).map(|_| rng.gen_range(0..9)).collect();
                replacement.insert("tags".into(), json!(tags));
                replacement.insert("n".into(), json!(rng.gen_range(0..1000)));
                store.replace_one(&owner, "notes", replacement).await.unwrap()
            }
            1 => {
                let spec = json!({"$inc": {"n": rng.gen_range(1..5)}, "$set": {"nested.k": rng.gen::<bool>()}});
                store
                    .update_one(&owner, "notes", Filter::id(id.as_str()), UpdateSpec::from_value(&spec).unwrap())
                    .await
                    .unwrap()
            }
            _ => store.replace_one(&owner, "notes", current.clone()).await.unwrap(),
        };
        if next.version() != current.version() {
            assert_eq!(next.version(), current.version() + 1);
            states.push(next);
        }
    }

    for state in &states {
        let rebuilt = store
            .get_document_version(&owner, "notes", &id, state.version())
            .await
            .unwrap();
        assert_eq!(&rebuilt, state);
    }
}

#[test]
fn shuffled_fragments_reassemble_exactly() {
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..100 {
        let len = rng.gen_range(0..300);
        let payload: String = (0..len)
            .map(|_| *['a', 'é', '✓', '7', ' '].choose(&mut rng).unwrap_or(&'a'))
            .collect();
        let messages: Vec<Message> = (0..3).map(|i| Message::request(format!("c{i}"), payload.clone())).collect();
        let mut fragments: Vec<_> = messages
            .iter()
            .cloned()
            .flat_map(|m| m.into_fragments(rng.gen_range(1..40)))
            .collect();
        fragments.shuffle(&mut rng);

        let mut reassembler = Reassembler::new(1000);
        let total = fragments.len();
        let mut done = Vec::new();
        for (i, fragment) in fragments.into_iter().enumerate() {
            if let Some(msg) = reassembler.push(fragment).unwrap() {
                done.push(msg);
            }
            if i + 1 < total {
                assert!(done.len() < 3);
            }
        }
        assert_eq!(done.len(), 3);
        for msg in &messages {
            assert!(done.contains(msg));
        }
        assert_eq!(reassembler.pending(), 0);
    }
}
