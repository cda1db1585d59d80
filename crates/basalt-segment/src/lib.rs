//! Segment contract and segment lifecycle for Basalt servers.
//!
//! Architecture role:
//! - defines the read-only [`Segment`]/[`DataSource`]/[`Dictionary`] contracts
//!   the execution layer plans against
//! - provides in-memory reference segments for embedded use and tests
//! - hosts the ref-counted acquire/release lifecycle and the metadata-only
//!   segment pruners
//!
//! Key modules:
//! - [`segment`]
//! - [`memory`]
//! - [`manager`]
//! - [`pruner`]

/// Ref-counted segment acquire/release lifecycle.
pub mod manager;
/// In-memory segment implementations.
pub mod memory;
/// Metadata-only segment pruning rules.
pub mod pruner;
/// Read-only segment contracts.
pub mod segment;

pub use manager::{InstanceDataManager, SegmentHandle, TableDataManager};
pub use memory::{MemorySegment, MemorySegmentBuilder};
pub use pruner::{
    ColumnValueSegmentPruner, EmptySegmentPruner, SegmentPruner, SegmentPrunerService,
};
pub use segment::{DataSource, Dictionary, Segment};
