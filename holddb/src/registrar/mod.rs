//! Schema registrar: turns GraphQL object types into catalog collections and
//! record tables.
//!
//! Registration runs in two passes so that types may reference types declared
//! later in the document, or themselves:
//!
//! 1. every type is inserted with its scalar fields only (ids get assigned,
//!    tables get created);
//! 2. each object-valued field is resolved to a collection id and appended,
//!    one field at a time.
//!
//! Pass 1 is all-or-nothing. Pass 2 is not: fields appended before a failure
//! stay in place. Each registration is journaled in the catalog first, and
//! [`Registrar::reconcile`] completes whatever an interrupted run left behind.

use crate::catalog::{
    Collection, CollectionDao, CollectionField, CollectionId, CollectionSpec, Registration,
    RegistrationStatus, ScalarType, SqliteCatalog,
};
use crate::context::Context;
use crate::error::{HoldError, Result, SourcePos};
use crate::graphql::{self, SchemaDocument, IMPLICIT_ID_FIELD};
use crate::records::{ColumnDef, RecordStore, TableDef};
use graphql_parser::schema::{Definition, ObjectType, Type, TypeDefinition, TypeExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Field type as written in a type definition, with list/non-null wrappers
/// reduced to what the catalog records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    pub type_name: String,
    pub is_list: bool,
}

impl TypeRef {
    pub fn from_ast(ty: &Type<'_, String>) -> Self {
        match ty {
            Type::NamedType(name) => TypeRef {
                type_name: name.clone(),
                is_list: false,
            },
            Type::ListType(inner) => TypeRef {
                is_list: true,
                ..TypeRef::from_ast(inner)
            },
            Type::NonNullType(inner) => TypeRef::from_ast(inner),
        }
    }

    /// Parse SDL type syntax such as `String`, `Person!` or `[Person!]`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let text = text.strip_suffix('!').unwrap_or(text).trim();
        if let Some(inner) = text.strip_prefix('[') {
            let inner = inner
                .strip_suffix(']')
                .ok_or_else(|| HoldError::Argument(format!("unbalanced list type '{text}'")))?;
            return Ok(TypeRef {
                is_list: true,
                ..TypeRef::parse(inner)?
            });
        }
        let valid = text.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(HoldError::Argument(format!("invalid type name '{text}'")));
        }
        Ok(TypeRef {
            type_name: text.to_string(),
            is_list: false,
        })
    }

    pub fn scalar(&self) -> Option<ScalarType> {
        ScalarType::from_name(&self.type_name)
    }
}

/// An object-valued field waiting for pass 2.
#[derive(Debug, Clone)]
struct DeferredField {
    name: String,
    type_ref: TypeRef,
    /// Namespace of the referenced type (from the field's own directive).
    namespace: String,
    position: SourcePos,
}

/// One object type of a document, split for the two passes.
#[derive(Debug, Clone)]
struct TypePlan {
    spec: CollectionSpec,
    scalars: Vec<CollectionField>,
    deferred: Vec<DeferredField>,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationReport {
    pub registration_id: i64,
    pub collections: Vec<(CollectionSpec, CollectionId)>,
    pub reference_fields: usize,
}

/// What a reconciliation pass repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub tables_created: usize,
    pub columns_added: usize,
    pub registrations_replayed: usize,
    pub registrations_failed: usize,
}

pub struct Registrar {
    catalog: Arc<SqliteCatalog>,
    records: Arc<RecordStore>,
    /// Serializes registrations, field appends and reconciliation.
    lock: Mutex<()>,
}

impl Registrar {
    pub fn new(catalog: Arc<SqliteCatalog>, records: Arc<RecordStore>) -> Self {
        Registrar {
            catalog,
            records,
            lock: Mutex::new(()),
        }
    }

    /// Register every object type of `document`.
    pub fn register_schema(
        &self,
        ctx: &Context,
        document: &SchemaDocument<'_>,
        version: &str,
    ) -> Result<RegistrationReport> {
        let plans = plan_document(document)?;
        let _guard = self.lock()?;

        let registration_id =
            self.catalog
                .begin_registration(ctx, version, &document.to_string())?;

        let collections = match self.run_pass_one(ctx, registration_id, &plans, version) {
            Ok(collections) => collections,
            Err(e) => {
                self.abandon(registration_id);
                return Err(e);
            }
        };
        log::info!(
            "registration {registration_id}: created {} collection(s)",
            collections.len()
        );

        let mut reference_fields = 0;
        for (plan, collection) in plans.iter().zip(&collections) {
            for deferred in &plan.deferred {
                if let Err(e) = self.add_reference_field(ctx, collection, deferred) {
                    self.abandon(registration_id);
                    return Err(e);
                }
                reference_fields += 1;
            }
        }

        self.catalog
            .finish_registration(ctx, registration_id, RegistrationStatus::Complete)?;
        log::info!(
            "registration {registration_id}: complete with {reference_fields} reference field(s)"
        );

        Ok(RegistrationReport {
            registration_id,
            collections: collections.iter().map(|c| (c.spec(), c.id)).collect(),
            reference_fields,
        })
    }

    /// Append one field to an existing collection and its table.
    ///
    /// `ref_namespace` selects the namespace of the referenced type when
    /// `type_ref` names an object type.
    pub fn append_field(
        &self,
        ctx: &Context,
        spec: &CollectionSpec,
        name: &str,
        type_ref: &TypeRef,
        ref_namespace: &str,
    ) -> Result<CollectionField> {
        let _guard = self.lock()?;
        let collection = self.catalog.find_collection_by_spec(ctx, spec)?;
        if name == IMPLICIT_ID_FIELD {
            return Err(HoldError::Argument(format!(
                "field '{IMPLICIT_ID_FIELD}' is the implicit primary key of {spec}"
            )));
        }
        if collection.fields.contains_key(name) {
            return Err(HoldError::AlreadyExists(format!("field {spec}.{name}")));
        }

        let field = match type_ref.scalar() {
            Some(scalar) => CollectionField::scalar(name, scalar, type_ref.is_list),
            None => {
                let target = CollectionSpec::new(type_ref.type_name.clone(), ref_namespace);
                let id = self.catalog.get_collection_id(ctx, &target)?;
                CollectionField::reference(name, type_ref.type_name.clone(), id, type_ref.is_list)
            }
        };
        self.add_field_unit(ctx, &collection, &field)?;
        log::info!("appended field {spec}.{name}");
        Ok(field)
    }

    /// Bring catalog and record store back in line after an interrupted
    /// registration: create missing tables and columns, then replay pass 2 of
    /// every registration still marked pending.
    pub fn reconcile(&self, ctx: &Context) -> Result<ReconcileReport> {
        let _guard = self.lock()?;
        let mut report = ReconcileReport::default();

        let collections = self.catalog.all_collections(ctx)?;
        for collection in &collections {
            let outcome = self
                .records
                .ensure_table(ctx, &TableDef::for_collection(collection))?;
            if outcome.created {
                report.tables_created += 1;
            }
            report.columns_added += outcome.columns_added;
        }
        let unready: Vec<CollectionId> = self
            .catalog
            .unready_collections(ctx)?
            .iter()
            .map(|c| c.id)
            .collect();
        self.catalog.mark_ready(ctx, &unready)?;

        for registration in self
            .catalog
            .registrations(ctx, Some(RegistrationStatus::Pending))?
        {
            match self.replay(ctx, &registration) {
                Ok(()) => {
                    self.catalog.finish_registration(
                        ctx,
                        registration.id,
                        RegistrationStatus::Complete,
                    )?;
                    report.registrations_replayed += 1;
                }
                Err(HoldError::Cancelled) => return Err(HoldError::Cancelled),
                Err(e) => {
                    log::warn!("registration {} could not be replayed: {e}", registration.id);
                    self.catalog.finish_registration(
                        ctx,
                        registration.id,
                        RegistrationStatus::Failed,
                    )?;
                    report.registrations_failed += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            log::info!("reconciliation repaired stores: {report:?}");
        }
        Ok(report)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| HoldError::Other("registrar lock poisoned".into()))
    }

    /// Pass 1: insert all collections with their scalar fields, then create
    /// their tables. If the tables cannot be created the catalog rows are
    /// removed again.
    fn run_pass_one(
        &self,
        ctx: &Context,
        registration_id: i64,
        plans: &[TypePlan],
        version: &str,
    ) -> Result<Vec<Collection>> {
        let mut collections: Vec<Collection> = plans
            .iter()
            .map(|plan| {
                let mut collection = Collection::new(&plan.spec, version);
                for field in &plan.scalars {
                    collection.add_field(field.clone());
                }
                collection
            })
            .collect();

        self.catalog
            .add_collections(ctx, Some(registration_id), &mut collections)?;
        let ids: Vec<CollectionId> = collections.iter().map(|c| c.id).collect();

        let tables: Vec<TableDef> = collections.iter().map(TableDef::for_collection).collect();
        if let Err(e) = self.records.create_tables(ctx, &tables) {
            // The request context may be the reason we failed; cleanup must
            // still run.
            if let Err(cleanup) = self.catalog.discard_unready(&Context::background(), &ids) {
                log::warn!(
                    "registration {registration_id}: could not discard collections after failed DDL: {cleanup}"
                );
            }
            return Err(e);
        }

        self.catalog.mark_ready(&Context::background(), &ids)?;
        Ok(collections)
    }

    /// Pass 2 for one field: resolve the referenced type and append the field.
    fn add_reference_field(
        &self,
        ctx: &Context,
        collection: &Collection,
        deferred: &DeferredField,
    ) -> Result<CollectionField> {
        let target = CollectionSpec::new(deferred.type_ref.type_name.clone(), deferred.namespace.clone());
        let target_id = match self.catalog.get_collection_id(ctx, &target) {
            Ok(id) => id,
            Err(HoldError::NotFound(_)) => {
                return Err(HoldError::schema(
                    format!(
                        "invalid collection reference: {}.{} refers to unknown type {target}",
                        collection.name, deferred.name
                    ),
                    deferred.position,
                ));
            }
            Err(e) => return Err(e),
        };
        let field = CollectionField::reference(
            deferred.name.clone(),
            deferred.type_ref.type_name.clone(),
            target_id,
            deferred.type_ref.is_list,
        );
        self.add_field_unit(ctx, collection, &field)?;
        Ok(field)
    }

    /// Column first, catalog second: a reader can never see a catalog field
    /// whose column is missing. The column add is idempotent, so a retry after
    /// a failed catalog write is safe.
    fn add_field_unit(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &CollectionField,
    ) -> Result<()> {
        self.records.add_column(
            ctx,
            &collection.table,
            &ColumnDef {
                name: field.name.clone(),
                storage: field.storage_type(),
            },
        )?;
        self.catalog.add_collection_field(ctx, collection.id, field)
    }

    /// Re-run pass 2 of a journaled document, skipping fields that already
    /// made it into the catalog. Only collections created by this
    /// registration are touched; a type without one means pass 1 never
    /// committed and the registration cannot be completed.
    fn replay(&self, ctx: &Context, registration: &Registration) -> Result<()> {
        let document = graphql::parse_schema(&registration.source)?;
        let owned: HashMap<CollectionSpec, Collection> = self
            .catalog
            .registration_collections(ctx, registration.id)?
            .into_iter()
            .map(|c| (c.spec(), c))
            .collect();

        for plan in plan_document(&document)? {
            let collection = owned.get(&plan.spec).ok_or_else(|| {
                HoldError::NotFound(format!(
                    "collection {} from registration {}",
                    plan.spec, registration.id
                ))
            })?;
            for deferred in &plan.deferred {
                if collection.fields.contains_key(&deferred.name) {
                    continue;
                }
                self.add_reference_field(ctx, collection, deferred)?;
            }
        }
        Ok(())
    }

    /// Best-effort: mark a registration failed without masking the original
    /// error.
    fn abandon(&self, registration_id: i64) {
        if let Err(e) = self.catalog.finish_registration(
            &Context::background(),
            registration_id,
            RegistrationStatus::Failed,
        ) {
            log::warn!("registration {registration_id}: could not record failure: {e}");
        }
    }
}

/// Split each object type into scalar fields and deferred object fields,
/// rejecting malformed documents before anything is written.
fn plan_document(document: &SchemaDocument<'_>) -> Result<Vec<TypePlan>> {
    let mut plans = Vec::new();
    let mut seen = HashSet::new();
    for def in &document.definitions {
        match def {
            Definition::TypeDefinition(TypeDefinition::Object(object)) => {
                let plan = plan_object(object)?;
                if !seen.insert(plan.spec.clone()) {
                    return Err(HoldError::schema(
                        format!("duplicate type definition: {}", plan.spec),
                        object.position,
                    ));
                }
                plans.push(plan);
            }
            Definition::TypeExtension(TypeExtension::Object(extension)) => {
                return Err(HoldError::schema(
                    format!(
                        "type extensions are not supported: append fields to {} instead",
                        extension.name
                    ),
                    extension.position,
                ));
            }
            _ => log::warn!("ignoring non-object definition in type document"),
        }
    }
    Ok(plans)
}

fn plan_object(object: &ObjectType<'_, String>) -> Result<TypePlan> {
    let namespace = graphql::namespace_from_directives(&object.directives)?.unwrap_or_default();
    let spec = CollectionSpec::new(object.name.clone(), namespace);
    if !object.name.chars().all(|c| c.is_ascii_alphabetic())
        || !object.name.starts_with(|c: char| c.is_ascii_uppercase())
    {
        log::warn!("type {spec} cannot be addressed by root query fields (expects [A-Z][a-zA-Z]*)");
    }

    let mut plan = TypePlan {
        spec,
        scalars: Vec::new(),
        deferred: Vec::new(),
    };
    let mut names = HashSet::new();
    for field in &object.fields {
        if !names.insert(field.name.as_str()) {
            return Err(HoldError::schema(
                format!("duplicate field: {}.{}", object.name, field.name),
                field.position,
            ));
        }
        let type_ref = TypeRef::from_ast(&field.field_type);

        if field.name == IMPLICIT_ID_FIELD {
            match type_ref.scalar() {
                Some(ScalarType::Id | ScalarType::Int) if !type_ref.is_list => continue,
                _ => {
                    return Err(HoldError::schema(
                        format!(
                            "field '{IMPLICIT_ID_FIELD}' on {} must be ID or Int (it is the primary key)",
                            object.name
                        ),
                        field.position,
                    ));
                }
            }
        }

        match type_ref.scalar() {
            Some(scalar) => plan.scalars.push(CollectionField::scalar(
                field.name.clone(),
                scalar,
                type_ref.is_list,
            )),
            None => plan.deferred.push(DeferredField {
                name: field.name.clone(),
                namespace: graphql::namespace_from_directives(&field.directives)?
                    .unwrap_or_default(),
                type_ref,
                position: field.position.into(),
            }),
        }
    }
    Ok(plan)
}
