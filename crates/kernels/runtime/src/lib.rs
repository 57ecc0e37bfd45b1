//! Weft Runtime.
//!
//! This crate executes lowered functions from `weft_ir` against concrete
//! set data. It is a reference interpreter: each lowered loop and memory
//! node is evaluated directly, which makes the result of lowering
//! observable without a code generator.
//!
//! # Architecture
//!
//! - [`bindings`] - caller-supplied sets, endpoint tuples, fields and parameters
//! - [`topology`] - per-invocation topology arena and resolved sparsity patterns
//! - [`value`] - blocks, integers and pattern misses the interpreter computes with
//! - [`interpret`] - buffer allocation, statement execution and solve glue
//! - [`error`] - error types for runtime failures
//!
//! # Execution Model
//!
//! One invocation proceeds as:
//!
//! 1. **Bind** - check the bindings against the function's declarations
//! 2. **Configure** - build topologies and resolve patterns
//! 3. **Run** - execute the lowered body over freshly allocated buffers
//! 4. **Commit** - apply staged field writes, return result variables
//!
//! Nothing survives an invocation except the committed field writes.
//!
//! # Example
//!
//! ```ignore
//! use weft_runtime::{execute, Bindings, SetData};
//!
//! let lowered = weft_ir::lower(&func, &LowerOptions::default())?;
//! let mut bindings = Bindings::new()
//!     .with_set("V", SetData::new(3))
//!     .with_set("E", SetData::relation(2, vec![0, 1, 1, 2]));
//! let result = execute(&lowered, &mut bindings, &SolverConfig::default())?;
//! println!("{:?}", result.values("x"));
//! ```

pub mod bindings;
pub mod error;
pub mod interpret;
pub mod topology;
pub mod value;

pub use bindings::{Bindings, EndpointData, FieldData, SetData};
pub use error::{Error, Result};
pub use interpret::{execute, ExecutionResult, TensorValue};
pub use topology::ExecutionTopology;
pub use value::{BlockValue, Value};
