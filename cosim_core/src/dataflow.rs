//! Simulator-level dataflow graph.
//!
//! Collapses entity connections into simulator edges. When several
//! connections join the same pair of simulators, the edge takes the most
//! permissive classification among them (`TimeShifted` > `Weak` >
//! `Immediate`).
//!
//! Only immediate edges constrain the stepping order at a given instant,
//! so the graph restricted to them must be acyclic. The topological order
//! computed here (Kahn's algorithm, ties broken by simulator id) is the
//! dispatch order when several simulators are ready at once.

use crate::entity_graph::{Connection, DelayKind, EntityGraph};
use crate::error::ConfigurationError;
use crate::ids::SimId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

type Edges = BTreeMap<SimId, BTreeMap<SimId, DelayKind>>;

/// Directed simulator graph with per-edge delay classification.
#[derive(Debug, Clone, Default)]
pub struct DataflowGraph {
    nodes: BTreeSet<SimId>,
    succ: Edges,
    pred: Edges,
    order: Vec<SimId>,
}

impl DataflowGraph {
    /// Builds the graph and validates that immediate edges are acyclic.
    pub fn build<'a, I>(sims: I, connections: &[Connection]) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = &'a SimId>,
    {
        let mut graph = Self {
            nodes: sims.into_iter().cloned().collect(),
            ..Self::default()
        };

        for conn in connections {
            graph.merge_edge(&conn.src.sid, &conn.dst.sid, conn.delay);
        }
        graph.order = graph.topological_order()?;

        debug!(
            sims = graph.nodes.len(),
            edges = graph.edge_count(),
            order = ?graph.order,
            "Dataflow graph built"
        );
        Ok(graph)
    }

    /// Builds the graph for every registered simulator of an entity graph.
    pub fn from_entity_graph<'a, I>(
        sims: I,
        entities: &EntityGraph,
    ) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = &'a SimId>,
    {
        Self::build(sims, entities.connections())
    }

    fn merge_edge(&mut self, src: &SimId, dst: &SimId, delay: DelayKind) {
        self.nodes.insert(src.clone());
        self.nodes.insert(dst.clone());

        let slot = self
            .succ
            .entry(src.clone())
            .or_default()
            .entry(dst.clone())
            .or_insert(delay);
        *slot = (*slot).max(delay);
        let merged = *slot;

        self.pred
            .entry(dst.clone())
            .or_default()
            .insert(src.clone(), merged);
    }

    fn immediate_succ(&self, sid: &SimId) -> impl Iterator<Item = &SimId> {
        self.succ
            .get(sid)
            .into_iter()
            .flatten()
            .filter(|(_, d)| d.orders_steps())
            .map(|(s, _)| s)
    }

    fn topological_order(&self) -> Result<Vec<SimId>, ConfigurationError> {
        let mut in_degree: BTreeMap<&SimId, usize> = self.nodes.iter().map(|n| (n, 0)).collect();
        for node in &self.nodes {
            for next in self.immediate_succ(node) {
                if let Some(d) = in_degree.get_mut(next) {
                    *d += 1;
                }
            }
        }

        let mut ready: BTreeSet<&SimId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(node.clone());
            for next in self.immediate_succ(node) {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let stuck: BTreeSet<&SimId> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n)
                .collect();
            Err(ConfigurationError::ImmediateCycle(self.find_cycle(&stuck)))
        }
    }

    /// Walks immediate edges inside the stuck set until a node repeats.
    fn find_cycle(&self, stuck: &BTreeSet<&SimId>) -> Vec<String> {
        let Some(&start) = stuck.iter().next() else {
            return Vec::new();
        };

        let mut path: Vec<&SimId> = vec![start];
        let mut current: &SimId = start;
        loop {
            let next = self
                .immediate_succ(current)
                .find(|n| stuck.contains(n));
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|p| *p == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return cycle;
            }
            path.push(next);
            current = next;
        }
        path.iter().map(|s| s.to_string()).collect()
    }

    /// Topological order over immediate edges.
    pub fn order(&self) -> &[SimId] {
        &self.order
    }

    /// Position of `sid` in [`order`](Self::order).
    pub fn rank(&self, sid: &SimId) -> Option<usize> {
        self.order.iter().position(|s| s == sid)
    }

    pub fn contains(&self, sid: &SimId) -> bool {
        self.nodes.contains(sid)
    }

    /// Aggregated classification of the edge `src -> dst`, if any.
    pub fn edge(&self, src: &SimId, dst: &SimId) -> Option<DelayKind> {
        self.succ.get(src).and_then(|m| m.get(dst)).copied()
    }

    pub fn edge_count(&self) -> usize {
        self.succ.values().map(BTreeMap::len).sum()
    }

    /// All predecessors of `sid` with their classification.
    pub fn predecessors<'a>(
        &'a self,
        sid: &SimId,
    ) -> impl Iterator<Item = (&'a SimId, DelayKind)> + 'a {
        self.pred
            .get(sid)
            .into_iter()
            .flatten()
            .map(|(s, d)| (s, *d))
    }

    /// Predecessors `sid` must wait for at equal simulation time.
    pub fn immediate_predecessors<'a>(
        &'a self,
        sid: &SimId,
    ) -> impl Iterator<Item = &'a SimId> + 'a {
        self.predecessors(sid)
            .filter(|(_, d)| d.orders_steps())
            .map(|(s, _)| s)
    }

    /// All successors of `sid` with their classification.
    pub fn successors<'a>(
        &'a self,
        sid: &SimId,
    ) -> impl Iterator<Item = (&'a SimId, DelayKind)> + 'a {
        self.succ
            .get(sid)
            .into_iter()
            .flatten()
            .map(|(s, d)| (s, *d))
    }

    /// Drops a simulator and every edge touching it.
    pub fn remove_simulator(&mut self, sid: &SimId) {
        self.nodes.remove(sid);
        self.order.retain(|s| s != sid);
        if let Some(out) = self.succ.remove(sid) {
            for dst in out.keys() {
                if let Some(p) = self.pred.get_mut(dst) {
                    p.remove(sid);
                }
            }
        }
        if let Some(inc) = self.pred.remove(sid) {
            for src in inc.keys() {
                if let Some(s) = self.succ.get_mut(src) {
                    s.remove(sid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FullId;
    use proptest::prelude::*;

    fn conn(src: &str, dst: &str, delay: DelayKind) -> Connection {
        Connection {
            src: FullId::new(src, "e"),
            dst: FullId::new(dst, "e"),
            attrs: vec![("out".to_string(), "in".to_string())],
            delay,
        }
    }

    fn sims(names: &[&str]) -> Vec<SimId> {
        names.iter().map(|n| SimId::from(*n)).collect()
    }

    #[test]
    fn test_order_follows_immediate_edges() {
        let ids = sims(&["C-0", "B-0", "A-0"]);
        let g = DataflowGraph::build(
            &ids,
            &[
                conn("A-0", "B-0", DelayKind::Immediate),
                conn("B-0", "C-0", DelayKind::Immediate),
            ],
        )
        .unwrap();

        assert_eq!(g.order(), sims(&["A-0", "B-0", "C-0"]).as_slice());
        assert_eq!(g.rank(&SimId::from("C-0")), Some(2));
    }

    #[test]
    fn test_edge_takes_most_permissive_classification() {
        let ids = sims(&["A-0", "B-0"]);
        let g = DataflowGraph::build(
            &ids,
            &[
                conn("A-0", "B-0", DelayKind::Immediate),
                conn("A-0", "B-0", DelayKind::TimeShifted),
                conn("A-0", "B-0", DelayKind::Weak),
            ],
        )
        .unwrap();

        let (a, b) = (SimId::from("A-0"), SimId::from("B-0"));
        assert_eq!(g.edge(&a, &b), Some(DelayKind::TimeShifted));
        assert_eq!(g.immediate_predecessors(&b).count(), 0);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_cycle_broken_by_weak_edge() {
        let ids = sims(&["A-0", "B-0"]);
        let g = DataflowGraph::build(
            &ids,
            &[
                conn("A-0", "B-0", DelayKind::Immediate),
                conn("B-0", "A-0", DelayKind::Weak),
            ],
        )
        .unwrap();
        assert_eq!(g.order(), sims(&["A-0", "B-0"]).as_slice());
    }

    #[test]
    fn test_immediate_cycle_rejected() {
        let ids = sims(&["A-0", "B-0", "C-0", "D-0"]);
        let err = DataflowGraph::build(
            &ids,
            &[
                conn("D-0", "A-0", DelayKind::Immediate),
                conn("A-0", "B-0", DelayKind::Immediate),
                conn("B-0", "C-0", DelayKind::Immediate),
                conn("C-0", "A-0", DelayKind::Immediate),
            ],
        )
        .unwrap_err();

        match err {
            ConfigurationError::ImmediateCycle(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                assert!(!path.contains(&"D-0".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_remove_simulator_drops_edges() {
        let ids = sims(&["A-0", "B-0", "C-0"]);
        let mut g = DataflowGraph::build(
            &ids,
            &[
                conn("A-0", "B-0", DelayKind::Immediate),
                conn("B-0", "C-0", DelayKind::Immediate),
            ],
        )
        .unwrap();

        g.remove_simulator(&SimId::from("B-0"));
        assert!(!g.contains(&SimId::from("B-0")));
        assert_eq!(g.immediate_predecessors(&SimId::from("C-0")).count(), 0);
        assert_eq!(g.successors(&SimId::from("A-0")).count(), 0);
        assert_eq!(g.order(), sims(&["A-0", "C-0"]).as_slice());
    }

    proptest! {
        /// Edges only go from lower to higher index, so the graph is a DAG
        /// and every edge must respect the computed order.
        #[test]
        fn prop_random_dag_is_ordered(
            n in 2usize..8,
            raw_edges in prop::collection::vec((0usize..8, 0usize..8, 0u8..3), 0..20),
        ) {
            let names: Vec<String> = (0..n).map(|i| format!("S{}-0", i)).collect();
            let ids: Vec<SimId> = names.iter().map(|s| SimId::from(s.as_str())).collect();
            let conns: Vec<Connection> = raw_edges
                .into_iter()
                .filter(|(a, b, _)| a < b && *b < n)
                .map(|(a, b, k)| {
                    let delay = match k {
                        0 => DelayKind::Immediate,
                        1 => DelayKind::Weak,
                        _ => DelayKind::TimeShifted,
                    };
                    conn(&names[a], &names[b], delay)
                })
                .collect();

            let g = DataflowGraph::build(&ids, &conns).unwrap();
            prop_assert_eq!(g.order().len(), n);
            for c in &conns {
                if g.edge(&c.src.sid, &c.dst.sid) == Some(DelayKind::Immediate) {
                    prop_assert!(g.rank(&c.src.sid) < g.rank(&c.dst.sid));
                }
            }
        }
    }
}
