use std::io;
use thiserror::Error;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to reach catalog at {url}: {message}")]
    Network { url: String, message: String },

    #[error("Catalog request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Invalid catalog document: {0}")]
    Validation(String),

    #[error("Catalog cache I/O error: {0}")]
    Io(#[from] io::Error),

    /// Fetch failed and no cached copy exists.
    #[error("Catalog unavailable from {url} and no cached copy exists: {cause}")]
    Unavailable {
        url: String,
        #[source]
        cause: Box<CatalogError>,
    },
}

impl CatalogError {
    /// The underlying failure, looking through `Unavailable`.
    pub fn root_cause(&self) -> &CatalogError {
        match self {
            CatalogError::Unavailable { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
