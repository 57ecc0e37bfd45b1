//! Weft Foundation
//!
//! Shared building blocks of the weft lowering core: typed identifiers,
//! block shapes, set topologies and the compressed-row sparsity patterns
//! they induce.
//!
//! Everything here is immutable once built and carries no execution state.

pub mod block;
pub mod ids;
pub mod pattern;
pub mod topology;

pub use block::BlockShape;
pub use ids::{FieldId, FuncId, SetId, TopologyId, VarId};
pub use pattern::{MergeIntersection, PatternError, SearchStrategy, SparsityPattern};
pub use topology::{Topology, TopologyArena, TopologyError};
