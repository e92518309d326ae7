//! Crucible core - isolated test runtime
//!
//! Loads, transforms and executes one test file and its dependency graph
//! inside a sandboxed environment, with layered mock substitution.

pub mod config;
pub mod error;
pub mod handle;
pub mod module;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod source_map;
pub mod transform;

pub use config::{NameMapperRule, ProjectConfig};
pub use error::RuntimeError;
pub use handle::FrameworkHandle;
pub use resolver::{ModuleId, ModuleResolver};
pub use runtime::{MockFactory, Runtime};
pub use source_map::SourceMapRegistry;
pub use transform::{ScriptTransformer, TransformResult};
