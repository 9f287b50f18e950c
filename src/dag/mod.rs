//! DAG building - user code → logical DAG → physical DAG
//!
//! - [`ast`]: the opaque-parser boundary (`CodeParser`) with the bundled
//!   [`SourceScanner`] for the documented operation set
//! - [`logical`]: arena-indexed abstract nodes (task / operation / loop /
//!   decision) with tagged edges and cycle detection
//! - [`builder`]: dependency inference, loop abstraction, nesting policy
//! - [`fusion`]: sequential and fork-join fusion into executable tasks
//! - [`physical`]: the executable task model and longest-path layering

pub mod ast;
pub mod builder;
pub mod fusion;
pub mod logical;
pub mod physical;

pub use ast::{CodeParser, LoopType, Program, SourceScanner, Span};
pub use builder::{build_logical, BuildOutput};
pub use fusion::fuse;
pub use logical::{EdgeKind, LogicalDag, LogicalEdge, LogicalNode, NodeId};
pub use physical::{
    DepVec, FusionPattern, PhysicalDag, PhysicalTask, SandboxConfig, TaskKind, TaskMetadata,
};
