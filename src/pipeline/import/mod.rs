pub mod dedup;
pub mod format;
pub mod hash;

pub use dedup::*;
pub use format::*;
pub use hash::*;

use std::path::PathBuf;

use thiserror::Error;

use crate::models::{ErrorKind, RecordError};

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Could not read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("Could not stage inline content for {name}: {source}")]
    Staging {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<InputError> for RecordError {
    fn from(e: InputError) -> Self {
        RecordError::new(ErrorKind::Input, e.to_string())
    }
}
