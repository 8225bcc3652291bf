//! The filesystem pipeline contract.
//!
//! The gateway is a linear pipeline of layers. Every layer implements the
//! same operation contract ([`FsLayer`]) and delegates to the next link:
//! the FUSE adapter sits at the head, the remote object-store client at the
//! tail, and the file cache in between. Types in this module are the shared
//! vocabulary of that pipeline.

/// Object attributes, permission bits, and open flags.
pub mod attr;
/// Error type surfaced across the pipeline.
pub mod error;
/// Open-file handles and the id registry.
pub mod handle;
/// The operation contract every pipeline layer implements.
pub mod layer;

pub use attr::{EntryKind, ObjectAttr, OpenFlags, Permissions};
pub use error::FsError;
pub use handle::{Handle, HandleFlags, HandleTable};
pub use layer::FsLayer;
