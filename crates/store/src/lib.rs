//! Persistence for the segmentation engine.
//!
//! SQLite repositories for runs, taxonomies, assignments, and the LLM
//! interaction index, plus the local blob store and the content-addressed
//! interaction cache layered over both.

pub mod assignments;
pub mod blob;
pub mod cache;
pub mod catalog;
pub mod db;
pub mod interactions;
pub mod runs;
pub mod taxonomies;

pub use assignments::{AssignmentRepository, SqliteAssignmentRepository};
pub use blob::BlobStore;
pub use cache::{cache_key, CacheContext, CachedInteraction, InteractionStore};
pub use catalog::{title_or_placeholder, ProductCatalog, SqliteProductCatalog};
pub use db::Database;
pub use interactions::{
    InteractionIndexRepository, NewInteraction, SqliteInteractionIndexRepository,
};
pub use runs::{RunRepository, SqliteRunRepository};
pub use taxonomies::{SqliteTaxonomyRepository, TaxonomyRepository};
