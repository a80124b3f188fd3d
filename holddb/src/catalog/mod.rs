//! Catalog store: the persistent record of collections and their fields.

mod sqlite;
mod types;

pub use sqlite::{Registration, RegistrationStatus, SqliteCatalog};
pub use types::{Collection, CollectionField, CollectionId, CollectionSpec, ScalarType};

use crate::context::Context;
use crate::error::Result;
use std::collections::{BTreeSet, HashMap};

/// Field names requested per collection spec (root level of a query).
pub type SpecFieldRequest = HashMap<CollectionSpec, BTreeSet<String>>;

/// Field names requested per collection id (nested levels of a query).
pub type IdFieldRequest = HashMap<CollectionId, BTreeSet<String>>;

/// Read access to the catalog. Only collections whose physical table exists
/// are visible through these lookups.
pub trait CollectionDao: Send + Sync {
    /// The collection with all of its fields. `NotFound` if absent.
    fn find_collection_by_spec(&self, ctx: &Context, spec: &CollectionSpec) -> Result<Collection>;

    /// The collection with all of its fields. `NotFound` if absent.
    fn find_collection_by_id(&self, ctx: &Context, id: CollectionId) -> Result<Collection>;

    fn get_collection_id(&self, ctx: &Context, spec: &CollectionSpec) -> Result<CollectionId>;

    /// One round trip for a set of specs, loading only the named fields of
    /// each. Specs that do not exist are absent from the result; requested
    /// names that are not fields are absent from the returned collection.
    fn find_collection_fields_by_spec(
        &self,
        ctx: &Context,
        requested: &SpecFieldRequest,
    ) -> Result<HashMap<CollectionSpec, Collection>>;

    /// Same as [`CollectionDao::find_collection_fields_by_spec`], keyed by id.
    fn find_collection_fields_by_id(
        &self,
        ctx: &Context,
        requested: &IdFieldRequest,
    ) -> Result<HashMap<CollectionId, Collection>>;

    fn list_collections(&self, ctx: &Context) -> Result<Vec<Collection>>;
}
