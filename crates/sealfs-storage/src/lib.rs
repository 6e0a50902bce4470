//! sealfs-storage: the uniform read/write contract and its OpenDAL backend
//!
//! Anything that implements [`Storage`] can be wrapped by a layer (for example
//! the streaming encryption layer in `sealfs-crypto`) which itself implements
//! [`Storage`] again.

pub mod backend;
pub mod error;
pub mod operator;

pub use backend::{
    read_full, read_to_end, source_from_bytes, ByteSource, BytesReader, ObjectMeta, ObjectRead,
    ObjectReader, Storage, WriteOptions, WriteOutcome,
};
pub use error::{StorageError, StorageResult};
pub use operator::{build_operator, OpendalStorage};
