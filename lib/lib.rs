//! blob-fs shared library.

/// Local file cache layer.
pub mod cache;
/// Pipeline contract shared by every filesystem layer.
pub mod fs;
