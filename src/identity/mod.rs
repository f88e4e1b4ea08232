//! Identity lookups against the directory service.

pub mod directory;

pub use directory::DirectoryClient;
