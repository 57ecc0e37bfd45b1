//! Unique identifiers for weft program symbols
//!
//! Sets, fields, variables and functions are identified by typed string
//! wrappers. Topologies are identified by dense integer handles into a
//! [`TopologyArena`](crate::TopologyArena).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Macro to define a name-based identifier type.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Creates a new identifier from a name.
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

define_id!(
    /// Unique identifier for a set (vertices, edges, subsets)
    SetId
);

define_id!(
    /// Unique identifier for a per-element field of a set
    FieldId
);

define_id!(
    /// Unique identifier for a program variable
    VarId
);

define_id!(
    /// Unique identifier for a function
    FuncId
);

/// Stable handle of a topology inside a [`TopologyArena`](crate::TopologyArena).
///
/// Handles are assigned in insertion order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyId(pub u32);

impl TopologyId {
    /// Index of the topology inside its arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TopologyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topology#{}", self.0)
    }
}
