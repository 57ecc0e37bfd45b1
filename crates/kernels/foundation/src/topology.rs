//! Set topologies as immutable index arrays.
//!
//! A relation set (edges, neighbour lists, subsets) connects each of its
//! elements to a fixed number of elements of an *endpoint set*. The
//! connectivity is stored as one flat array of endpoint indices, `arity`
//! entries per element, in element insertion order.
//!
//! # Overview
//!
//! - [`Topology`] - one relation's endpoint tuples, plus the sparsity
//!   patterns it induces
//! - [`TopologyArena`] - owns every topology of one execution and hands out
//!   stable [`TopologyId`] handles
//!
//! Subsets are arity-1 relations: element `d` of `D(V)` maps to exactly one
//! element of `V`, available through [`Topology::parent_of`].
//!
//! Topologies never change after construction. Patterns derived from them
//! depend only on the set of endpoint tuples, not on the order elements were
//! inserted.

use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::{SetId, SparsityPattern, TopologyId};

/// Errors raised while building topologies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// A relation must connect each element to at least one endpoint.
    #[error("relation '{relation}' has arity 0")]
    ZeroArity {
        /// Relation being built
        relation: SetId,
    },

    /// The endpoint array length is not a multiple of the arity.
    #[error("relation '{relation}' has {len} endpoint entries, not a multiple of arity {arity}")]
    RaggedTuples {
        /// Relation being built
        relation: SetId,
        /// Length of the endpoint array
        len: usize,
        /// Declared arity
        arity: usize,
    },

    /// An endpoint refers past the end of the endpoint set.
    #[error("relation '{relation}' element {element} refers to endpoint {endpoint}, but '{endpoint_set}' has {count} elements")]
    EndpointOutOfRange {
        /// Relation being built
        relation: SetId,
        /// Offending element
        element: usize,
        /// Offending endpoint index
        endpoint: usize,
        /// Set the endpoints index into
        endpoint_set: SetId,
        /// Size of the endpoint set
        count: usize,
    },

    /// A topology for this relation is already registered.
    #[error("relation '{0}' already has a topology")]
    Duplicate(SetId),
}

/// Endpoint tuples of one relation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    relation: SetId,
    endpoint_set: SetId,
    endpoint_count: usize,
    arity: usize,
    tuples: Arc<[usize]>,
}

impl Topology {
    /// Build a topology from a flat endpoint array (`arity` entries per element).
    pub fn new(
        relation: SetId,
        endpoint_set: SetId,
        endpoint_count: usize,
        arity: usize,
        tuples: Vec<usize>,
    ) -> Result<Self, TopologyError> {
        if arity == 0 {
            return Err(TopologyError::ZeroArity { relation });
        }
        if tuples.len() % arity != 0 {
            return Err(TopologyError::RaggedTuples {
                relation,
                len: tuples.len(),
                arity,
            });
        }
        if let Some(pos) = tuples.iter().position(|&ep| ep >= endpoint_count) {
            return Err(TopologyError::EndpointOutOfRange {
                relation,
                element: pos / arity,
                endpoint: tuples[pos],
                endpoint_set,
                count: endpoint_count,
            });
        }
        Ok(Self {
            relation,
            endpoint_set,
            endpoint_count,
            arity,
            tuples: tuples.into(),
        })
    }

    /// Build a subset mapping: element `d` of `relation` is element
    /// `parents[d]` of `endpoint_set`.
    pub fn subset(
        relation: SetId,
        endpoint_set: SetId,
        endpoint_count: usize,
        parents: Vec<usize>,
    ) -> Result<Self, TopologyError> {
        Self::new(relation, endpoint_set, endpoint_count, 1, parents)
    }

    /// The relation set this topology describes.
    pub fn relation(&self) -> &SetId {
        &self.relation
    }

    /// The set the endpoints index into.
    pub fn endpoint_set(&self) -> &SetId {
        &self.endpoint_set
    }

    /// Size of the endpoint set.
    pub fn endpoint_count(&self) -> usize {
        self.endpoint_count
    }

    /// Endpoints per element.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Number of relation elements.
    pub fn len(&self) -> usize {
        self.tuples.len() / self.arity
    }

    /// True if the relation has no elements.
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Endpoint tuple of an element.
    pub fn endpoints(&self, element: usize) -> &[usize] {
        let start = element * self.arity;
        &self.tuples[start..start + self.arity]
    }

    /// Endpoint in `slot` of an element, or `None` when either is out of range.
    pub fn endpoint(&self, element: usize, slot: usize) -> Option<usize> {
        if slot >= self.arity {
            return None;
        }
        self.tuples.get(element * self.arity + slot).copied()
    }

    /// Parent element of a subset element (first endpoint).
    pub fn parent_of(&self, element: usize) -> Option<usize> {
        self.endpoint(element, 0)
    }

    /// Iterate `(element, endpoints)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> + '_ {
        self.tuples.chunks_exact(self.arity).enumerate()
    }

    /// Square endpoint-to-endpoint pattern.
    ///
    /// Contains `(a, b)` for every ordered pair of endpoints sharing an
    /// element, and the full diagonal of the endpoint set.
    pub fn square_pattern(&self) -> SparsityPattern {
        let n = self.endpoint_count;
        let mut coordinates: Vec<(usize, usize)> = (0..n).map(|i| (i, i)).collect();
        for (_, endpoints) in self.iter() {
            for &a in endpoints {
                for &b in endpoints {
                    coordinates.push((a, b));
                }
            }
        }
        SparsityPattern::from_coordinates(n, n, coordinates)
    }

    /// Rectangular element-to-endpoint pattern (`len x endpoint_count`).
    ///
    /// Row `e` holds the endpoints of element `e`. Its transpose gives the
    /// endpoint-to-element pattern.
    pub fn incidence_pattern(&self) -> SparsityPattern {
        let coordinates = self
            .iter()
            .flat_map(|(e, endpoints)| endpoints.iter().map(move |&v| (e, v)))
            .collect();
        SparsityPattern::from_coordinates(self.len(), self.endpoint_count, coordinates)
    }
}

/// Owner of the topologies of one execution.
///
/// Handles are dense indices assigned in insertion order; each relation set
/// has at most one topology.
#[derive(Debug, Default)]
pub struct TopologyArena {
    topologies: Vec<Topology>,
    by_relation: IndexMap<SetId, TopologyId>,
}

impl TopologyArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a topology and return its handle.
    pub fn insert(&mut self, topology: Topology) -> Result<TopologyId, TopologyError> {
        if self.by_relation.contains_key(topology.relation()) {
            return Err(TopologyError::Duplicate(topology.relation().clone()));
        }
        let id = TopologyId(self.topologies.len() as u32);
        self.by_relation.insert(topology.relation().clone(), id);
        self.topologies.push(topology);
        Ok(id)
    }

    /// Topology behind a handle.
    pub fn get(&self, id: TopologyId) -> Option<&Topology> {
        self.topologies.get(id.index())
    }

    /// Handle of a relation's topology.
    pub fn id_of(&self, relation: &SetId) -> Option<TopologyId> {
        self.by_relation.get(relation).copied()
    }

    /// Topology of a relation set.
    pub fn by_relation(&self, relation: &SetId) -> Option<&Topology> {
        self.id_of(relation).and_then(|id| self.get(id))
    }

    /// Number of registered topologies.
    pub fn len(&self) -> usize {
        self.topologies.len()
    }

    /// True if no topology is registered.
    pub fn is_empty(&self) -> bool {
        self.topologies.is_empty()
    }

    /// Iterate `(handle, topology)` in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (TopologyId, &Topology)> {
        self.topologies
            .iter()
            .enumerate()
            .map(|(i, t)| (TopologyId(i as u32), t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SearchStrategy;

    fn path() -> Topology {
        Topology::new(SetId::from("E"), SetId::from("V"), 3, 2, vec![0, 1, 1, 2]).unwrap()
    }

    #[test]
    fn test_endpoints() {
        let t = path();
        assert_eq!(t.len(), 2);
        assert_eq!(t.endpoints(1), &[1, 2]);
        assert_eq!(t.endpoint(0, 1), Some(1));
        assert_eq!(t.endpoint(0, 2), None);
        assert_eq!(t.endpoint(5, 0), None);
        let order: Vec<_> = t.iter().map(|(e, _)| e).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_square_pattern_includes_diagonal() {
        // Vertex 3 is isolated but still gets a diagonal entry
        let t = Topology::new(SetId::from("E"), SetId::from("V"), 4, 2, vec![0, 1, 1, 2]).unwrap();
        let p = t.square_pattern();
        assert_eq!(p.row_offsets(), &[0, 2, 5, 7, 8]);
        assert_eq!(p.col_indices(), &[0, 1, 0, 1, 2, 1, 2, 3]);
        assert!(!p.contains(0, 2));
    }

    #[test]
    fn test_pattern_independent_of_insertion_order() {
        let a = Topology::new(SetId::from("E"), SetId::from("V"), 4, 2, vec![0, 1, 2, 3, 1, 2])
            .unwrap();
        let b = Topology::new(SetId::from("E"), SetId::from("V"), 4, 2, vec![2, 1, 3, 2, 1, 0])
            .unwrap();
        assert_eq!(a.square_pattern(), b.square_pattern());
    }

    #[test]
    fn test_incidence_pattern() {
        let p = path().incidence_pattern();
        assert_eq!((p.rows(), p.cols()), (2, 3));
        assert_eq!(p.locate(1, 2, SearchStrategy::Binary), Some(3));
        assert!(!p.contains(0, 2));
    }

    #[test]
    fn test_subset_parent() {
        let d = Topology::subset(SetId::from("D"), SetId::from("V"), 3, vec![0, 2]).unwrap();
        assert_eq!(d.arity(), 1);
        assert_eq!(d.parent_of(1), Some(2));
        assert_eq!(d.parent_of(2), None);
    }

    #[test]
    fn test_invalid_topologies() {
        let err = Topology::new(SetId::from("E"), SetId::from("V"), 3, 2, vec![0, 1, 2])
            .unwrap_err();
        assert!(matches!(err, TopologyError::RaggedTuples { len: 3, .. }));

        let err = Topology::new(SetId::from("E"), SetId::from("V"), 3, 2, vec![0, 1, 1, 3])
            .unwrap_err();
        assert!(matches!(
            err,
            TopologyError::EndpointOutOfRange { element: 1, endpoint: 3, .. }
        ));
    }

    #[test]
    fn test_arena_handles() {
        let mut arena = TopologyArena::new();
        let e = arena.insert(path()).unwrap();
        let d = arena
            .insert(Topology::subset(SetId::from("D"), SetId::from("V"), 3, vec![0]).unwrap())
            .unwrap();
        assert_eq!(e, TopologyId(0));
        assert_eq!(d, TopologyId(1));
        assert_eq!(arena.id_of(&SetId::from("D")), Some(d));
        assert_eq!(arena.by_relation(&SetId::from("E")).map(Topology::len), Some(2));
        assert_eq!(
            arena.insert(path()).unwrap_err(),
            TopologyError::Duplicate(SetId::from("E"))
        );
    }
}
