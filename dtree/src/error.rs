use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors produced while acquiring a device tree document.
#[derive(Debug, Error)]
pub enum Error {
    /// The source text does not follow the devicetree source grammar.
    #[error("{file}:{line}.{column}: syntax error near '{near}'")]
    Syntax {
        file: String,
        line: u32,
        column: usize,
        near: String,
    },

    #[error("cannot read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A `&label` or `&{/path}` reference names no node.
    #[error("reference to non-existent node or label '{0}'")]
    UnresolvedReference(String),

    #[error("label '{0}' is defined on more than one node")]
    DuplicateLabel(String),

    /// `#include` needs the C preprocessor, which is not run.
    #[error("C preprocessor include '{0}' is not supported, preprocess the source first")]
    Preprocessor(String),

    #[error("invalid expression: {0}")]
    Expression(String),

    #[error("/bits/ size {0} is not one of 8, 16, 32 or 64")]
    BitsSize(u32),

    #[error("{0}")]
    Value(String),

    /// The input is not a well-formed flattened device tree blob.
    #[error("invalid flattened device tree: {0}")]
    Dtb(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
