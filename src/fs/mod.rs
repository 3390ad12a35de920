//! The virtual filesystem engine: node model, tree, per-variant I/O,
//! synthetic files, and the error taxonomy.

pub mod engine;
pub mod error;
pub mod node;
pub mod rubric;
pub mod scratch;
pub mod synthetic;
pub mod tree;

pub use engine::{DirListEntry, Engine, EngineOptions};
pub use error::FsError;
pub use node::{Attributes, NodeId, ROOT_ID};
