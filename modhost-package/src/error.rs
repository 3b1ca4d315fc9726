//! Error types for the package crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("descriptor has no `main` entry")]
    MissingMain,

    #[error("descriptor is not valid UTF-8")]
    DescriptorEncoding,

    #[error("invalid artifact coordinate `{0}`: expected group:artifact:version")]
    InvalidCoordinate(String),
}
