//! Generated schemas and tuple sets checked against a direct reading of
//! the rewrite rules.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use crate::schema::{
    EntityDefinition, PermissionDef, RelationDef, RewriteRule, Schema, SubjectTypeRef,
};
use crate::tuple::{EntityRef, SubjectRef, TenantId, Tuple};

use super::fixture::{FixtureReader, tuple};
use super::{
    CheckEngine, CheckError, CheckRequest, EngineConfig, LookupEngine, LookupRequest,
    RequestMetadata,
};

const DOCS: [&str; 3] = ["0", "1", "2"];
const USERS: [&str; 3] = ["0", "1", "2"];
const GROUPS: usize = 4;

type Engine = CheckEngine<FixtureReader, FixtureReader>;

fn subject_types(type_name: &str, relation: Option<&str>) -> Vec<SubjectTypeRef> {
    vec![SubjectTypeRef {
        type_name: type_name.to_string(),
        relation: relation.map(str::to_string),
    }]
}

fn relation(name: &str, subjects: Vec<SubjectTypeRef>) -> RelationDef {
    RelationDef {
        name: name.to_string(),
        subject_types: subjects,
    }
}

/// `doc` with relations r0..r2 on users, a `parent` folder whose `member`
/// relation holds users, and `view` defined by `rule`.
fn generated_schema(rule: RewriteRule) -> Schema {
    let mut doc_relations: Vec<RelationDef> = (0..3)
        .map(|r| relation(&format!("r{r}"), subject_types("user", None)))
        .collect();
    doc_relations.push(relation("parent", subject_types("folder", None)));

    Schema {
        types: vec![
            EntityDefinition {
                name: "user".to_string(),
                relations: vec![],
                permissions: vec![],
            },
            EntityDefinition {
                name: "folder".to_string(),
                relations: vec![relation("member", subject_types("user", None))],
                permissions: vec![],
            },
            EntityDefinition {
                name: "doc".to_string(),
                relations: doc_relations,
                permissions: vec![PermissionDef {
                    name: "view".to_string(),
                    rule,
                }],
            },
        ],
    }
}

/// `group.member` holds users and other groups' members; `doc.viewer`
/// holds group members.
fn group_schema() -> Schema {
    let mut member_subjects = subject_types("user", None);
    member_subjects.extend(subject_types("group", Some("member")));
    Schema {
        types: vec![
            EntityDefinition {
                name: "user".to_string(),
                relations: vec![],
                permissions: vec![],
            },
            EntityDefinition {
                name: "group".to_string(),
                relations: vec![relation("member", member_subjects)],
                permissions: vec![],
            },
            EntityDefinition {
                name: "doc".to_string(),
                relations: vec![relation("viewer", subject_types("group", Some("member")))],
                permissions: vec![],
            },
        ],
    }
}

fn rule_strategy() -> impl Strategy<Value = RewriteRule> {
    let leaf = prop_oneof![
        (0..3usize).prop_map(|r| RewriteRule::This(format!("r{r}"))),
        Just(RewriteRule::Arrow("parent".to_string(), "member".to_string())),
    ];
    leaf.prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(RewriteRule::Union),
            prop::collection::vec(inner.clone(), 0..4).prop_map(RewriteRule::Intersection),
            inner.prop_map(|child| RewriteRule::Exclusion(Box::new(child))),
        ]
    })
}

fn tuples_strategy() -> impl Strategy<Value = Vec<Tuple>> {
    let direct = (0..3usize, 0..3usize, 0..3usize)
        .prop_map(|(d, r, u)| tuple(&format!("doc:{d}#r{r}@user:{u}")));
    let parent = (0..3usize, 0..2usize)
        .prop_map(|(d, f)| tuple(&format!("doc:{d}#parent@folder:{f}")));
    let member = (0..2usize, 0..3usize)
        .prop_map(|(f, u)| tuple(&format!("folder:{f}#member@user:{u}")));
    prop::collection::vec(prop_oneof![3 => direct, 1 => parent, 1 => member], 0..16)
}

fn holds(tuples: &[Tuple], entity: &EntityRef, relation: &str, user: &str) -> bool {
    let subject = SubjectRef::direct("user", user);
    tuples
        .iter()
        .any(|t| &t.entity == entity && t.relation == relation && t.subject == subject)
}

/// The rule read literally: union is any, intersection is all (and empty
/// denies), exclusion negates, arrows go through `parent` folders.
fn expected(rule: &RewriteRule, doc: &str, user: &str, tuples: &[Tuple]) -> bool {
    let entity = EntityRef::new("doc", doc);
    match rule {
        RewriteRule::This(relation) => holds(tuples, &entity, relation, user),
        RewriteRule::Arrow(relation, target) => tuples
            .iter()
            .filter(|t| t.entity == entity && &t.relation == relation)
            .any(|t| holds(tuples, &t.subject.entity(), target, user)),
        RewriteRule::Union(children) => children.iter().any(|c| expected(c, doc, user, tuples)),
        RewriteRule::Intersection(children) => {
            !children.is_empty() && children.iter().all(|c| expected(c, doc, user, tuples))
        }
        RewriteRule::Exclusion(child) => !expected(child, doc, user, tuples),
        RewriteRule::Computed(_) => unreachable!("not generated"),
    }
}

fn engine(reader: FixtureReader) -> Engine {
    let reader = Arc::new(reader);
    CheckEngine::new(Arc::clone(&reader), reader, EngineConfig::default())
}

fn request(
    entity: EntityRef,
    permission: &str,
    user: &str,
    metadata: RequestMetadata,
) -> CheckRequest {
    CheckRequest {
        tenant_id: TenantId::new(uuid::Uuid::nil()),
        entity,
        permission: permission.to_string(),
        subject: SubjectRef::direct("user", user),
        metadata,
    }
}

fn view(engine: &Engine, doc: &str, user: &str, metadata: RequestMetadata) -> bool {
    let req = request(EntityRef::new("doc", doc), "view", user, metadata);
    tokio_test::block_on(engine.check(&req))
        .expect("acyclic data never fails")
        .allowed
}

/// Groups reachable from `starts` over member edges.
fn reachable(starts: &[usize], edges: &[(usize, usize)]) -> HashSet<usize> {
    let mut seen: HashSet<usize> = starts.iter().copied().collect();
    let mut frontier: Vec<usize> = seen.iter().copied().collect();
    while let Some(group) = frontier.pop() {
        for &(from, to) in edges {
            if from == group && seen.insert(to) {
                frontier.push(to);
            }
        }
    }
    seen
}

fn reaches_cycle(starts: &[usize], edges: &[(usize, usize)]) -> bool {
    fn visit(node: usize, edges: &[(usize, usize)], state: &mut [u8; GROUPS]) -> bool {
        match state[node] {
            1 => return true,
            2 => return false,
            _ => {}
        }
        state[node] = 1;
        let cyclic = edges
            .iter()
            .any(|&(from, to)| from == node && visit(to, edges, state));
        state[node] = 2;
        cyclic
    }

    let mut state = [0u8; GROUPS];
    starts.iter().any(|&start| visit(start, edges, &mut state))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn check_follows_combinator_laws(rule in rule_strategy(), tuples in tuples_strategy()) {
        let engine = engine(
            FixtureReader::new(tuples.clone()).with_schema(generated_schema(rule.clone())),
        );

        for doc in DOCS {
            for user in USERS {
                let allowed = view(&engine, doc, user, RequestMetadata::new(20));
                prop_assert_eq!(
                    allowed,
                    expected(&rule, doc, user, &tuples),
                    "doc:{} user:{} rule {:?}", doc, user, rule
                );
            }
        }
    }

    #[test]
    fn verdicts_ignore_tuple_order(rule in rule_strategy(), tuples in tuples_strategy()) {
        let forward = engine(
            FixtureReader::new(tuples.clone()).with_schema(generated_schema(rule.clone())),
        );
        let mut reversed = tuples;
        reversed.reverse();
        let backward = engine(
            FixtureReader::new(reversed)
                .with_schema(generated_schema(rule))
                .reversed(),
        );

        for doc in DOCS {
            for user in USERS {
                prop_assert_eq!(
                    view(&forward, doc, user, RequestMetadata::new(20)),
                    view(&backward, doc, user, RequestMetadata::new(20))
                );
            }
        }
    }

    #[test]
    fn contextual_tuples_act_like_stored_ones(
        rule in rule_strategy(),
        tuples in tuples_strategy(),
        mask in prop::collection::vec(any::<bool>(), 16),
    ) {
        let (contextual, stored): (Vec<(usize, Tuple)>, Vec<(usize, Tuple)>) = tuples
            .iter()
            .cloned()
            .enumerate()
            .partition(|(i, _)| mask[*i]);
        let all_stored = engine(
            FixtureReader::new(tuples.clone()).with_schema(generated_schema(rule.clone())),
        );
        let split = engine(
            FixtureReader::new(stored.into_iter().map(|(_, t)| t).collect())
                .with_schema(generated_schema(rule)),
        );
        let contextual: Vec<Tuple> = contextual.into_iter().map(|(_, t)| t).collect();

        for doc in DOCS {
            for user in USERS {
                let metadata = RequestMetadata::new(20).with_contextual_tuples(contextual.clone());
                prop_assert_eq!(
                    view(&all_stored, doc, user, RequestMetadata::new(20)),
                    view(&split, doc, user, metadata)
                );
            }
        }
    }

    #[test]
    fn lookup_returns_exactly_the_allowed_candidates(
        rule in rule_strategy(),
        tuples in tuples_strategy(),
    ) {
        let reader = Arc::new(
            FixtureReader::new(tuples.clone()).with_schema(generated_schema(rule)),
        );
        let lookup = LookupEngine::new(Arc::clone(&reader), reader, EngineConfig::default());
        let candidates: HashSet<&str> = tuples
            .iter()
            .filter(|t| t.entity.entity_type == "doc")
            .map(|t| t.entity.entity_id.as_str())
            .collect();

        for user in USERS {
            let found = tokio_test::block_on(lookup.lookup_entity(&LookupRequest {
                tenant_id: TenantId::new(uuid::Uuid::nil()),
                entity_type: "doc".to_string(),
                permission: "view".to_string(),
                subject: SubjectRef::direct("user", user),
                metadata: RequestMetadata::new(20),
                limit: None,
                sorted: true,
            }))
            .unwrap();

            let allowed: Vec<String> = DOCS
                .iter()
                .filter(|doc| candidates.contains(*doc))
                .filter(|doc| view(lookup.check_engine(), doc, user, RequestMetadata::new(20)))
                .map(|doc| doc.to_string())
                .collect();
            prop_assert_eq!(found.entity_ids, allowed);
        }
    }

    #[test]
    fn group_cycles_end_in_a_verdict_or_depth_error(
        edges in prop::collection::vec((0..GROUPS, 0..GROUPS), 0..10),
        alice_in in prop::collection::vec(0..GROUPS, 0..2),
        starts in prop::collection::vec(0..GROUPS, 1..3),
    ) {
        let mut tuples: Vec<Tuple> = edges
            .iter()
            .map(|(a, b)| tuple(&format!("group:{a}#member@group:{b}#member")))
            .collect();
        tuples.extend(alice_in.iter().map(|g| tuple(&format!("group:{g}#member@user:alice"))));
        tuples.extend(starts.iter().map(|g| tuple(&format!("doc:1#viewer@group:{g}#member"))));
        let engine = engine(FixtureReader::new(tuples).with_schema(group_schema()));
        let req = request(
            EntityRef::new("doc", "1"),
            "viewer",
            "alice",
            RequestMetadata::new(50),
        );

        let outcome = tokio_test::block_on(engine.check(&req));

        let granted = reachable(&starts, &edges).iter().any(|g| alice_in.contains(g));
        if granted {
            prop_assert!(matches!(outcome, Ok(ref r) if r.allowed), "{:?}", outcome);
        } else if reaches_cycle(&starts, &edges) {
            prop_assert!(matches!(outcome, Err(CheckError::DepthExceeded(50))), "{:?}", outcome);
        } else {
            prop_assert!(matches!(outcome, Ok(ref r) if !r.allowed), "{:?}", outcome);
        }
    }
}
