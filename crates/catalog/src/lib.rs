// # -----------------------------
// # crates/catalog/src/lib.rs
// # -----------------------------
pub mod cache;
pub mod error;
pub mod model;
pub mod query;

pub use cache::{CacheEnvelope, CatalogCache, CatalogOrigin, DEFAULT_CATALOG_URL};
pub use error::{CatalogError, CatalogResult};
pub use model::{normalize_base_url, Catalog, Cost, Model, ProviderEntry, SdkPolicy, SdkRule};
pub use query::{select_preferred, CatalogQuery, SelectionFilter};
