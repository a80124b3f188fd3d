//! GraphQL document helpers shared by the registrar, validator and resolver.

use crate::catalog::CollectionSpec;
use crate::error::{HoldError, Result, SourcePos};
use graphql_parser::query::{
    Definition, Directive, Field, OperationDefinition, Selection as QuerySelection, SelectionSet,
    Value,
};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub type QueryDocument<'a> = graphql_parser::query::Document<'a, String>;
pub type SchemaDocument<'a> = graphql_parser::schema::Document<'a, String>;

/// Root query fields must be named `<verb><TypeName>`.
pub const ROOT_FIELD_PATTERN: &str = "^(?:find|list|patch|set)([A-Z][a-zA-Z]*)$";

/// Directive selecting a collection namespace: `@namespace(name: "...")`.
pub const NAMESPACE_DIRECTIVE: &str = "namespace";

/// Every record table has this implicit integer key; it is selectable in
/// queries without being declared.
pub const IMPLICIT_ID_FIELD: &str = "id";

fn root_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ROOT_FIELD_PATTERN).expect("root field pattern is valid"))
}

pub fn parse_query(source: &str) -> Result<QueryDocument<'_>> {
    graphql_parser::parse_query::<String>(source).map_err(|e| HoldError::Parse(e.to_string()))
}

pub fn parse_schema(source: &str) -> Result<SchemaDocument<'_>> {
    graphql_parser::parse_schema::<String>(source).map_err(|e| HoldError::Parse(e.to_string()))
}

/// A requested field and its nested selections, detached from the AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub name: String,
    pub alias: Option<String>,
    /// Namespace required of the referenced collection, if the field carries
    /// a namespace directive.
    pub namespace: Option<String>,
    pub position: SourcePos,
    pub children: Vec<Selection>,
}

impl Selection {
    /// Key under which this field appears in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

/// A top-level query field bound to one collection.
#[derive(Debug, Clone)]
pub struct RootField<'d, 'a> {
    pub field: &'d Field<'a, String>,
    pub spec: CollectionSpec,
    pub selections: Vec<Selection>,
}

impl RootField<'_, '_> {
    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn response_key(&self) -> &str {
        self.field.alias.as_deref().unwrap_or(&self.field.name)
    }

    pub fn position(&self) -> SourcePos {
        self.field.position.into()
    }
}

/// Root fields of every query operation in the document, in document order.
/// Response keys (alias or name) must be distinct across the document.
pub fn root_fields<'d, 'a>(doc: &'d QueryDocument<'a>) -> Result<Vec<RootField<'d, 'a>>> {
    let mut out = Vec::new();
    let mut keys = HashSet::new();
    for def in &doc.definitions {
        let selection_set = match def {
            Definition::Operation(OperationDefinition::Query(query)) => &query.selection_set,
            Definition::Operation(OperationDefinition::SelectionSet(set)) => set,
            Definition::Operation(OperationDefinition::Mutation(m)) => {
                return Err(HoldError::schema("only query operations are supported", m.position));
            }
            Definition::Operation(OperationDefinition::Subscription(s)) => {
                return Err(HoldError::schema("only query operations are supported", s.position));
            }
            Definition::Fragment(f) => {
                return Err(HoldError::schema("fragments are not supported", f.position));
            }
        };
        for item in &selection_set.items {
            let field = as_field(item)?;
            let key = field.alias.as_deref().unwrap_or(&field.name);
            if !keys.insert(key) {
                return Err(HoldError::schema(
                    format!("fields need distinct aliases: {key}"),
                    field.position,
                ));
            }
            out.push(RootField {
                field,
                spec: root_field_spec(field)?,
                selections: selections(&field.selection_set)?,
            });
        }
    }
    Ok(out)
}

/// Derive the collection spec of a root field from its name and namespace
/// directive.
pub fn root_field_spec(field: &Field<'_, String>) -> Result<CollectionSpec> {
    let name = root_field_regex()
        .captures(&field.name)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| {
            HoldError::schema(
                format!(
                    "invalid operation name: {} should match {ROOT_FIELD_PATTERN}",
                    field.name
                ),
                field.position,
            )
        })?;
    let namespace = namespace_from_directives(&field.directives)?.unwrap_or_default();
    Ok(CollectionSpec::new(name.as_str(), namespace))
}

/// Read the namespace directive, if present. It must take exactly one string
/// argument called `name`.
pub fn namespace_from_directives(directives: &[Directive<'_, String>]) -> Result<Option<String>> {
    for directive in directives {
        if directive.name != NAMESPACE_DIRECTIVE {
            continue;
        }
        return match directive.arguments.as_slice() {
            [(arg, Value::String(value))] if arg == "name" => Ok(Some(value.clone())),
            _ => Err(HoldError::schema(
                "namespace directive should take one string argument named 'name'",
                directive.position,
            )),
        };
    }
    Ok(None)
}

/// Convert a selection set into owned [`Selection`]s.
pub fn selections(set: &SelectionSet<'_, String>) -> Result<Vec<Selection>> {
    set.items
        .iter()
        .map(|item| {
            let field = as_field(item)?;
            Ok(Selection {
                name: field.name.clone(),
                alias: field.alias.clone(),
                namespace: namespace_from_directives(&field.directives)?,
                position: field.position.into(),
                children: selections(&field.selection_set)?,
            })
        })
        .collect()
}

/// The integer `id` argument of a root field.
pub fn record_id(field: &Field<'_, String>) -> Result<i64> {
    let (_, value) = field
        .arguments
        .iter()
        .find(|(name, _)| name == "id")
        .ok_or_else(|| HoldError::Argument(format!("no id arg on {}", field.name)))?;
    match value {
        Value::Int(n) => n
            .as_i64()
            .ok_or_else(|| HoldError::Argument(format!("id arg out of range on {}", field.name))),
        _ => Err(HoldError::Argument(format!(
            "id arg needs to be int on {}",
            field.name
        ))),
    }
}

fn as_field<'d, 'a>(item: &'d QuerySelection<'a, String>) -> Result<&'d Field<'a, String>> {
    match item {
        QuerySelection::Field(field) => Ok(field),
        QuerySelection::FragmentSpread(spread) => Err(HoldError::schema(
            "fragments are not supported",
            spread.position,
        )),
        QuerySelection::InlineFragment(fragment) => Err(HoldError::schema(
            "fragments are not supported",
            fragment.position,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(err: HoldError) -> String {
        err.reason().unwrap_or_default().to_string()
    }

    #[test]
    fn test_root_fields_and_specs() {
        let doc = parse_query(
            r#"
            query {
                findPost(id: 1) { title }
                latest: listPerson(id: 2) @namespace(name: "social") { name }
            }
            "#,
        )
        .unwrap();
        let roots = root_fields(&doc).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].spec, CollectionSpec::named("Post"));
        assert_eq!(roots[1].spec, CollectionSpec::new("Person", "social"));
        assert_eq!(roots[1].name(), "listPerson");
        assert_eq!(roots[1].response_key(), "latest");
    }

    #[test]
    fn test_duplicate_response_keys_rejected() {
        let doc = parse_query("{ findPost(id: 1) { title } findPost(id: 2) { title } }").unwrap();
        let err = root_fields(&doc).unwrap_err();
        assert_eq!(reason(err), "fields need distinct aliases: findPost");

        let doc = parse_query("{ a: findPost(id: 1) { title } a: findPerson(id: 2) { name } }")
            .unwrap();
        assert!(root_fields(&doc).is_err());

        let doc = parse_query("{ findPost(id: 1) { title } other: findPost(id: 2) { title } }")
            .unwrap();
        assert_eq!(root_fields(&doc).unwrap().len(), 2);
    }

    #[test]
    fn test_anonymous_selection_set_operation() {
        let doc = parse_query("{ setPost(id: 3) { title } }").unwrap();
        let roots = root_fields(&doc).unwrap();
        assert_eq!(roots[0].spec.name, "Post");
    }

    #[test]
    fn test_invalid_operation_name() {
        let doc = parse_query("{ removeFoo(id: 1) { x } }").unwrap();
        let err = root_fields(&doc).unwrap_err();
        assert!(reason(err).starts_with("invalid operation name: removeFoo"));
    }

    #[test]
    fn test_lowercase_type_rejected() {
        let doc = parse_query("{ findpost(id: 1) { x } }").unwrap();
        assert!(root_fields(&doc).is_err());
    }

    #[test]
    fn test_malformed_namespace_directive() {
        for query in [
            r#"{ findPost(id: 1) @namespace(name: 3) { x } }"#,
            r#"{ findPost(id: 1) @namespace(ns: "a") { x } }"#,
            r#"{ findPost(id: 1) @namespace { x } }"#,
            r#"{ findPost(id: 1) @namespace(name: "a", other: "b") { x } }"#,
        ] {
            let doc = parse_query(query).unwrap();
            let err = root_fields(&doc).unwrap_err();
            assert_eq!(
                reason(err),
                "namespace directive should take one string argument named 'name'"
            );
        }
    }

    #[test]
    fn test_nested_selections() {
        let doc = parse_query(
            r#"{ findPost(id: 1) { title author @namespace(name: "people") { name } } }"#,
        )
        .unwrap();
        let roots = root_fields(&doc).unwrap();
        let sels = &roots[0].selections;
        assert_eq!(sels.len(), 2);
        assert!(!sels[0].has_children());
        assert_eq!(sels[1].name, "author");
        assert_eq!(sels[1].namespace.as_deref(), Some("people"));
        assert_eq!(sels[1].children[0].name, "name");
    }

    #[test]
    fn test_fragments_rejected() {
        let doc = parse_query("{ findPost(id: 1) { ...PostParts } } fragment PostParts on Post { title }")
            .unwrap();
        assert!(root_fields(&doc).is_err());
    }

    #[test]
    fn test_mutations_rejected() {
        let doc = parse_query("mutation { setPost(id: 1) { title } }").unwrap();
        assert!(root_fields(&doc).is_err());
    }

    #[test]
    fn test_record_id() {
        let doc = parse_query(
            r#"{ findPost(id: 7) { t } findPerson { n } findTag(id: "x") { n } }"#,
        )
        .unwrap();
        let roots = root_fields(&doc).unwrap();
        assert_eq!(record_id(roots[0].field).unwrap(), 7);
        assert!(matches!(record_id(roots[1].field), Err(HoldError::Argument(_))));
        assert!(matches!(record_id(roots[2].field), Err(HoldError::Argument(_))));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse_query("{ findPost("), Err(HoldError::Parse(_))));
        assert!(matches!(parse_schema("type {"), Err(HoldError::Parse(_))));
    }
}
