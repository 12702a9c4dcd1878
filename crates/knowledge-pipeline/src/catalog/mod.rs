//! Repository catalog: repositories, the directory tree and file lifecycle outside the
//! slice/embed pipeline

mod arena;
mod service;

pub use arena::DirectoryArena;
pub use service::{Catalog, DeleteSummary};
