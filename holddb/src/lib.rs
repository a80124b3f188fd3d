pub mod catalog;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod graphql;
pub mod records;
pub mod registrar;
pub mod resolver;
pub mod sql;
pub mod validator;

pub use catalog::{Collection, CollectionDao, CollectionField, CollectionSpec, SqliteCatalog};
pub use config::EngineConfig;
pub use context::{CancelHandle, Context};
pub use engine::{Engine, Response};
pub use error::{HoldError, Result};
pub use records::RecordStore;
pub use registrar::{ReconcileReport, Registrar};
pub use resolver::{Resolver, ResponseData};
pub use validator::{ValidationSnapshot, Validator};
