//! Query validation against the live catalog.
//!
//! Validation walks the selection tree one depth level at a time and asks the
//! catalog for every collection of a level in a single batched lookup, so the
//! number of catalog round trips grows with query depth, not query size.

use crate::catalog::{
    Collection, CollectionDao, CollectionId, CollectionSpec, IdFieldRequest, SpecFieldRequest,
};
use crate::context::Context;
use crate::error::{HoldError, Result};
use crate::graphql::{self, QueryDocument, Selection, IMPLICIT_ID_FIELD};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The part of the catalog a query touches: exactly the collections and
/// fields it selects. Enough for resolution without further catalog access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSnapshot {
    pub collections: BTreeMap<CollectionId, Collection>,
    #[serde(serialize_with = "serialize_roots")]
    pub root_collection_ids: BTreeMap<CollectionSpec, CollectionId>,
}

impl ValidationSnapshot {
    pub fn collection(&self, id: CollectionId) -> Option<&Collection> {
        self.collections.get(&id)
    }

    pub fn root_collection(&self, spec: &CollectionSpec) -> Option<&Collection> {
        self.root_collection_ids
            .get(spec)
            .and_then(|id| self.collections.get(id))
    }

    fn absorb(&mut self, collection: Collection) {
        match self.collections.get_mut(&collection.id) {
            Some(existing) => existing.merge_fields(collection),
            None => {
                self.collections.insert(collection.id, collection);
            }
        }
    }
}

fn serialize_roots<S: Serializer>(
    roots: &BTreeMap<CollectionSpec, CollectionId>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(roots.iter().map(|(spec, id)| (spec.to_string(), id)))
}

/// A reference field waiting for its target collection to be loaded.
struct Pending<'s> {
    target: CollectionId,
    field: &'s Selection,
}

pub struct Validator {
    dao: Arc<dyn CollectionDao>,
}

impl Validator {
    pub fn new(dao: Arc<dyn CollectionDao>) -> Self {
        Validator { dao }
    }

    /// Check every root field of `document` against the catalog and return
    /// the snapshot the resolver needs. Fails on the first violation.
    pub fn validate_root_selections(
        &self,
        ctx: &Context,
        document: &QueryDocument<'_>,
    ) -> Result<ValidationSnapshot> {
        let roots = graphql::root_fields(document)?;

        let mut request = SpecFieldRequest::new();
        for root in &roots {
            if root.selections.is_empty() {
                return Err(HoldError::schema(
                    format!("need a selection set for object fields: {}", root.name()),
                    root.position(),
                ));
            }
            request
                .entry(root.spec.clone())
                .or_default()
                .extend(catalog_names(&root.selections));
        }

        let mut snapshot = ValidationSnapshot::default();
        if request.is_empty() {
            return Ok(snapshot);
        }
        let mut found = self.dao.find_collection_fields_by_spec(ctx, &request)?;

        let mut level: Vec<(CollectionId, &[Selection])> = Vec::with_capacity(roots.len());
        for root in &roots {
            let collection = found.remove(&root.spec);
            let id = match collection {
                Some(collection) => {
                    let id = collection.id;
                    snapshot.absorb(collection);
                    id
                }
                // Same spec seen on an earlier root field.
                None => match snapshot.root_collection_ids.get(&root.spec) {
                    Some(id) => *id,
                    None => {
                        return Err(HoldError::schema(
                            format!("invalid collection: {}", root.spec),
                            root.position(),
                        ));
                    }
                },
            };
            snapshot.root_collection_ids.insert(root.spec.clone(), id);
            level.push((id, root.selections.as_slice()));
        }

        let mut depth = 0;
        while !level.is_empty() {
            let pending = check_level(&snapshot, &level)?;
            if pending.is_empty() {
                break;
            }
            depth += 1;

            let request = next_request(&snapshot, &pending);
            if !request.is_empty() {
                for (_, collection) in self.dao.find_collection_fields_by_id(ctx, &request)? {
                    snapshot.absorb(collection);
                }
            }

            level = Vec::with_capacity(pending.len());
            for p in pending {
                let target = snapshot.collection(p.target).ok_or_else(|| {
                    HoldError::schema(
                        format!("invalid collection reference: {}", p.field.name),
                        p.field.position,
                    )
                })?;
                if let Some(namespace) = &p.field.namespace {
                    if *namespace != target.namespace {
                        return Err(HoldError::schema(
                            format!(
                                "invalid collection reference: {} points to {}, not namespace '{namespace}'",
                                p.field.name,
                                target.spec()
                            ),
                            p.field.position,
                        ));
                    }
                }
                level.push((p.target, p.field.children.as_slice()));
            }
        }
        log::debug!(
            "validated {} root field(s) over {} collection(s), depth {depth}",
            roots.len(),
            snapshot.collections.len()
        );
        Ok(snapshot)
    }
}

/// Check one level of selections against the collections loaded so far and
/// collect the reference fields that lead one level deeper.
fn check_level<'s>(
    snapshot: &ValidationSnapshot,
    level: &[(CollectionId, &'s [Selection])],
) -> Result<Vec<Pending<'s>>> {
    let mut pending = Vec::new();
    for (id, selections) in level.iter().copied() {
        let Some(collection) = snapshot.collection(id) else {
            return Err(HoldError::NotFound(format!("collection id {id}")));
        };
        for selection in selections {
            if selection.name == IMPLICIT_ID_FIELD {
                if selection.has_children() {
                    return Err(not_object(selection));
                }
                continue;
            }
            let field = collection.fields.get(&selection.name).ok_or_else(|| {
                HoldError::schema(
                    format!("invalid field: {}", selection.name),
                    selection.position,
                )
            })?;
            match (field.is_reference(), selection.has_children()) {
                (false, false) => {}
                (false, true) => return Err(not_object(selection)),
                (true, false) => {
                    return Err(HoldError::schema(
                        format!("need a selection set for object fields: {}", selection.name),
                        selection.position,
                    ));
                }
                (true, true) => pending.push(Pending {
                    target: field.reference,
                    field: selection,
                }),
            }
        }
    }
    Ok(pending)
}

/// Union the requested names per target, dropping what is already loaded.
/// Targets never seen before are requested even with no names so that a
/// missing collection is detected.
fn next_request(snapshot: &ValidationSnapshot, pending: &[Pending<'_>]) -> IdFieldRequest {
    let mut wanted: BTreeMap<CollectionId, BTreeSet<String>> = BTreeMap::new();
    for p in pending {
        wanted
            .entry(p.target)
            .or_default()
            .extend(catalog_names(&p.field.children));
    }

    let mut request = IdFieldRequest::new();
    for (id, names) in wanted {
        match snapshot.collection(id) {
            Some(known) => {
                let missing: BTreeSet<String> = names
                    .into_iter()
                    .filter(|n| !known.fields.contains_key(n))
                    .collect();
                if !missing.is_empty() {
                    request.insert(id, missing);
                }
            }
            None => {
                request.insert(id, names);
            }
        }
    }
    request
}

/// Field names to fetch from the catalog; `id` is implicit and never stored.
fn catalog_names(selections: &[Selection]) -> impl Iterator<Item = String> + '_ {
    selections
        .iter()
        .filter(|s| s.name != IMPLICIT_ID_FIELD)
        .map(|s| s.name.clone())
}

fn not_object(selection: &Selection) -> HoldError {
    HoldError::schema(
        format!("field not object type: {}", selection.name),
        selection.position,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CollectionField, ScalarType, SqliteCatalog};
    use crate::error::SourcePos;
    use crate::records::RecordStore;
    use crate::registrar::{Registrar, TypeRef};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BLOG: &str = r#"
        type Post {
            title: String
            body: String
            author: Person
        }
        type Person {
            name: String
            age: Int
            friends: [Person]
        }
        type Person @namespace(name: "staff") {
            name: String
        }
    "#;

    /// Delegates to a real catalog, counting the batched lookups.
    struct CountingDao {
        inner: Arc<SqliteCatalog>,
        by_spec: AtomicUsize,
        by_id: AtomicUsize,
    }

    impl CountingDao {
        fn calls(&self) -> (usize, usize) {
            (
                self.by_spec.load(Ordering::SeqCst),
                self.by_id.load(Ordering::SeqCst),
            )
        }
    }

    impl CollectionDao for CountingDao {
        fn find_collection_by_spec(&self, ctx: &Context, spec: &CollectionSpec) -> Result<Collection> {
            self.inner.find_collection_by_spec(ctx, spec)
        }

        fn find_collection_by_id(&self, ctx: &Context, id: CollectionId) -> Result<Collection> {
            self.inner.find_collection_by_id(ctx, id)
        }

        fn get_collection_id(&self, ctx: &Context, spec: &CollectionSpec) -> Result<CollectionId> {
            self.inner.get_collection_id(ctx, spec)
        }

        fn find_collection_fields_by_spec(
            &self,
            ctx: &Context,
            requested: &SpecFieldRequest,
        ) -> Result<HashMap<CollectionSpec, Collection>> {
            self.by_spec.fetch_add(1, Ordering::SeqCst);
            self.inner.find_collection_fields_by_spec(ctx, requested)
        }

        fn find_collection_fields_by_id(
            &self,
            ctx: &Context,
            requested: &IdFieldRequest,
        ) -> Result<HashMap<CollectionId, Collection>> {
            self.by_id.fetch_add(1, Ordering::SeqCst);
            self.inner.find_collection_fields_by_id(ctx, requested)
        }

        fn list_collections(&self, ctx: &Context) -> Result<Vec<Collection>> {
            self.inner.list_collections(ctx)
        }
    }

    struct Fixture {
        dao: Arc<CountingDao>,
        registrar: Registrar,
        validator: Validator,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().unwrap());
        let records = Arc::new(RecordStore::open_in_memory().unwrap());
        let registrar = Registrar::new(catalog.clone(), records);
        let doc = graphql::parse_schema(BLOG).unwrap();
        registrar
            .register_schema(&Context::background(), &doc, "v1")
            .unwrap();

        let dao = Arc::new(CountingDao {
            inner: catalog,
            by_spec: AtomicUsize::new(0),
            by_id: AtomicUsize::new(0),
        });
        Fixture {
            validator: Validator::new(dao.clone()),
            dao,
            registrar,
        }
    }

    fn validate(f: &Fixture, query: &str) -> Result<ValidationSnapshot> {
        let doc = graphql::parse_query(query).unwrap();
        f.validator
            .validate_root_selections(&Context::background(), &doc)
    }

    fn reason(err: HoldError) -> String {
        err.reason().map(str::to_string).unwrap_or_else(|| err.to_string())
    }

    #[test]
    fn test_snapshot_holds_only_selected_fields() {
        let f = fixture();
        let snapshot =
            validate(&f, "{ findPost(id: 1) { title author { name } } }").unwrap();

        let post = snapshot.root_collection(&CollectionSpec::named("Post")).unwrap();
        assert_eq!(post.fields.keys().collect::<Vec<_>>(), vec!["author", "title"]);

        let person_id = post.fields["author"].reference;
        let person = snapshot.collection(person_id).unwrap();
        assert_eq!(person.fields.keys().collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(snapshot.collections.len(), 2);
    }

    #[test]
    fn test_one_catalog_call_per_level() {
        let f = fixture();
        validate(
            &f,
            r#"{
                a: findPost(id: 1) { title author { name friends { name } } }
                b: findPost(id: 2) { body author { age } }
            }"#,
        )
        .unwrap();
        // Root level by spec, then one lookup for Person at depth 1. Depth 2
        // asks only for Person.name, already loaded.
        assert_eq!(f.dao.calls(), (1, 1));
    }

    #[test]
    fn test_deeper_level_fetches_only_new_names() {
        let f = fixture();
        validate(
            &f,
            "{ findPost(id: 1) { author { name friends { age friends { name } } } } }",
        )
        .unwrap();
        // depth 1: {name, friends}; depth 2: {age} is new; depth 3: cached.
        assert_eq!(f.dao.calls(), (1, 2));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let f = fixture();
        let query = "{ findPerson(id: 1) { name friends { name } } findPost(id: 1) { title } }";
        let first = validate(&f, query).unwrap();
        let second = validate(&f, query).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn test_root_namespace_selects_collection() {
        let f = fixture();
        let snapshot =
            validate(&f, r#"{ findPerson(id: 1) @namespace(name: "staff") { name } }"#).unwrap();
        let staff = snapshot
            .root_collection(&CollectionSpec::new("Person", "staff"))
            .unwrap();
        assert_eq!(staff.table, "staff__Person");

        let err = validate(&f, r#"{ findPerson(id: 1) @namespace(name: "staff") { age } }"#)
            .unwrap_err();
        assert_eq!(reason(err), "invalid field: age");
    }

    #[test]
    fn test_implicit_id_is_selectable() {
        let f = fixture();
        let snapshot = validate(&f, "{ findPost(id: 1) { id author { id } } }").unwrap();
        assert_eq!(snapshot.collections.len(), 2);

        let err = validate(&f, "{ findPost(id: 1) { id { name } } }").unwrap_err();
        assert_eq!(reason(err), "field not object type: id");
    }

    #[test]
    fn test_rejections() {
        let f = fixture();
        let cases = [
            (
                "{ removePost(id: 1) { title } }",
                "invalid operation name: removePost should match ^(?:find|list|patch|set)([A-Z][a-zA-Z]*)$",
            ),
            ("{ findPost(id: 1) { title { x } } }", "field not object type: title"),
            (
                "{ findPost(id: 1) { author } }",
                "need a selection set for object fields: author",
            ),
            (
                "{ findPost(id: 1) }",
                "need a selection set for object fields: findPost",
            ),
            ("{ findPost(id: 1) { rating } }", "invalid field: rating"),
            ("{ findComment(id: 1) { text } }", "invalid collection: Comment"),
            (
                "{ findPost(id: 1) { author { nickname } } }",
                "invalid field: nickname",
            ),
            (
                r#"{ findPost(id: 1) { author @namespace(name: "staff") { name } } }"#,
                "invalid collection reference: author points to Person, not namespace 'staff'",
            ),
            (
                "{ findPost(id: 1) @namespace { title } }",
                "namespace directive should take one string argument named 'name'",
            ),
        ];
        for (query, expected) in cases {
            let err = validate(&f, query).unwrap_err();
            assert_eq!(reason(err), expected, "{query}");
        }
    }

    #[test]
    fn test_error_carries_position() {
        let f = fixture();
        let err = validate(&f, "{\n  findPost(id: 1) {\n    nope\n  }\n}").unwrap_err();
        match err {
            HoldError::SchemaValidation { position, .. } => {
                assert_eq!(position, SourcePos { line: 3, column: 5 });
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_appended_field_validates_immediately() {
        let f = fixture();
        assert!(validate(&f, "{ findPost(id: 1) { views } }").is_err());

        f.registrar
            .append_field(
                &Context::background(),
                &CollectionSpec::named("Post"),
                "views",
                &TypeRef::parse("Int").unwrap(),
                "",
            )
            .unwrap();
        let snapshot = validate(&f, "{ findPost(id: 1) { views } }").unwrap();
        let post = snapshot.root_collection(&CollectionSpec::named("Post")).unwrap();
        assert_eq!(
            post.fields["views"],
            CollectionField::scalar("views", ScalarType::Int, false)
        );
    }
}
