use std::path::PathBuf;

use thiserror::Error;

use crate::Finding;

/// Errors that end a validation run early.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The document could not be read, parsed or compiled.
    #[error("{source}")]
    Load {
        path: PathBuf,
        #[source]
        source: dtree::Error,
    },

    /// The first failure of a run with raise-on-error enabled.
    #[error("{0}")]
    Aborted(Finding),
}

/// Errors detected while building a schema.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("element '{element}' has an invalid pattern '{pattern}': {source}")]
    Pattern {
        element: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
