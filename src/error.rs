//! Error kinds for the HDF5 reader.
//!
//! One variant per failure mode named in the format spec: unsupported
//! on-disk versions/filters/datatypes/layouts, missing links, uninitialized
//! storage, structural corruption, and I/O failures from the byte source.

/// Errors that can occur while opening a file or reading from it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("unsupported filter id {0}")]
    UnsupportedFilter(u16),

    #[error("unsupported datatype class {0}")]
    UnsupportedDatatype(u8),

    #[error("unsupported data layout class {0}")]
    UnsupportedLayout(u8),

    #[error("no such link: {0}")]
    NotFound(String),

    #[error("dataset storage is uninitialized")]
    Uninitialized,

    #[error("corrupt HDF5 structure: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
