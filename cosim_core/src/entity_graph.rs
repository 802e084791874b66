//! The Entity & Relationship Graph.
//!
//! Nodes are entities (model instances owned by one simulator). Two kinds of
//! links exist:
//! - **Relations**: parent/child composition and `rel` hints from `create`
//! - **Connections**: attribute-level data dependencies declared by the
//!   scenario, each carrying a [`DelayKind`]
//!
//! Both contribute to the undirected adjacency used by
//! `get_related_entities`. Connections are frozen once stepping begins;
//! entities may still be added later.

use crate::error::ConfigurationError;
use crate::ids::{FullId, SimId};
use crate::meta::{EntityDescriptor, ModelMeta, SimMeta};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// How a connection constrains same-instant stepping order.
///
/// Ordered from most to least constraining, so `max` picks the most
/// permissive classification.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DelayKind {
    /// Destination steps after the source at the same instant
    #[default]
    Immediate,

    /// Breaks a cycle: destination may step with a one-step-stale value
    Weak,

    /// Destination only ever sees output from an earlier instant
    TimeShifted,
}

impl DelayKind {
    /// True if the destination must wait for the source at equal times.
    pub fn orders_steps(self) -> bool {
        self == DelayKind::Immediate
    }
}

/// A model instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub sid: SimId,
    pub eid: String,
    pub model: String,
    pub children: Vec<FullId>,
}

impl Entity {
    pub fn full_id(&self) -> FullId {
        FullId::new(self.sid.clone(), self.eid.clone())
    }
}

/// An attribute-level data dependency between two entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub src: FullId,
    pub dst: FullId,

    /// `(source attr, destination attr)` in declaration order
    pub attrs: Vec<(String, String)>,

    pub delay: DelayKind,
}

/// Summary of an entity as reported to simulators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    #[serde(rename = "type")]
    pub model: String,
    pub sid: SimId,
}

/// Whole-graph view for `get_related_entities()` without arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, EntityInfo>,
    pub edges: Vec<(String, String)>,
}

/// The entity graph.
#[derive(Debug, Default)]
pub struct EntityGraph {
    /// Metadata of every registered simulator
    metas: BTreeMap<SimId, SimMeta>,

    /// All entities by full id
    entities: BTreeMap<FullId, Entity>,

    /// Declared connections in insertion order
    connections: Vec<Connection>,

    /// Undirected adjacency (relations + connections)
    adjacency: BTreeMap<FullId, BTreeSet<FullId>>,

    /// Set when stepping begins
    frozen: bool,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a simulator's metadata so its entities can be validated.
    pub fn register_simulator(&mut self, sid: SimId, meta: SimMeta) {
        self.metas.insert(sid, meta);
    }

    /// Returns a simulator's metadata.
    pub fn meta(&self, sid: &str) -> Option<&SimMeta> {
        self.metas.get(sid)
    }

    fn model_meta(&self, sid: &SimId, model: &str) -> Result<&ModelMeta, ConfigurationError> {
        self.metas
            .get(sid.as_str())
            .ok_or_else(|| ConfigurationError::UnknownSimulator(sid.to_string()))?
            .model(model)
            .ok_or_else(|| ConfigurationError::UnknownModel {
                sid: sid.to_string(),
                model: model.to_string(),
            })
    }

    /// Adds one entity. `children` are eids of already-added entities owned
    /// by the same simulator.
    pub fn add_entity(
        &mut self,
        sid: &SimId,
        eid: &str,
        model: &str,
        children: &[String],
    ) -> Result<FullId, ConfigurationError> {
        self.model_meta(sid, model)?;

        let full_id = FullId::new(sid.clone(), eid);
        if self.entities.contains_key(&full_id) {
            return Err(ConfigurationError::DuplicateEntity(full_id.to_string()));
        }

        let children: Vec<FullId> = children
            .iter()
            .map(|child| FullId::new(sid.clone(), child.as_str()))
            .collect();
        if let Some(missing) = children.iter().find(|c| !self.entities.contains_key(*c)) {
            return Err(ConfigurationError::UnknownEntity(missing.to_string()));
        }

        for child in &children {
            self.link(&full_id, child);
        }
        self.adjacency.entry(full_id.clone()).or_default();
        self.entities.insert(
            full_id.clone(),
            Entity {
                sid: sid.clone(),
                eid: eid.to_string(),
                model: model.to_string(),
                children,
            },
        );

        debug!(entity = %full_id, model, "Entity added");
        Ok(full_id)
    }

    /// Adds the entities returned by `create`, children first, then their
    /// `rel` links. Returns the full ids of the top-level entities.
    ///
    /// The whole batch is checked first; on error nothing is added.
    pub fn add_descriptors(
        &mut self,
        sid: &SimId,
        descriptors: &[EntityDescriptor],
    ) -> Result<Vec<FullId>, ConfigurationError> {
        self.check_descriptors(sid, descriptors)?;

        let mut relations = Vec::new();
        let mut top_level = Vec::with_capacity(descriptors.len());

        for desc in descriptors {
            top_level.push(self.add_descriptor(sid, desc, &mut relations)?);
        }

        for (from, rel) in relations {
            let to = resolve_rel(sid, &rel)?;
            self.link(&from, &to);
        }

        Ok(top_level)
    }

    /// Rejects duplicate ids, unknown models and dangling `rel` targets in a
    /// batch of descriptors.
    fn check_descriptors(
        &self,
        sid: &SimId,
        descriptors: &[EntityDescriptor],
    ) -> Result<(), ConfigurationError> {
        let mut batch = BTreeSet::new();
        let mut rels = Vec::new();
        let mut pending: Vec<&EntityDescriptor> = descriptors.iter().collect();

        while let Some(desc) = pending.pop() {
            self.model_meta(sid, &desc.model)?;
            let full_id = FullId::new(sid.clone(), desc.eid.as_str());
            if self.entities.contains_key(&full_id) || !batch.insert(full_id.clone()) {
                return Err(ConfigurationError::DuplicateEntity(full_id.to_string()));
            }
            rels.extend(desc.rel.iter());
            pending.extend(desc.children.iter());
        }

        for rel in rels {
            let to = resolve_rel(sid, rel)?;
            if !self.entities.contains_key(&to) && !batch.contains(&to) {
                return Err(ConfigurationError::UnknownEntity(to.to_string()));
            }
        }
        Ok(())
    }

    fn add_descriptor(
        &mut self,
        sid: &SimId,
        desc: &EntityDescriptor,
        relations: &mut Vec<(FullId, String)>,
    ) -> Result<FullId, ConfigurationError> {
        for child in &desc.children {
            self.add_descriptor(sid, child, relations)?;
        }
        let child_eids: Vec<String> = desc.children.iter().map(|c| c.eid.clone()).collect();
        let full_id = self.add_entity(sid, &desc.eid, &desc.model, &child_eids)?;
        relations.extend(desc.rel.iter().map(|r| (full_id.clone(), r.clone())));
        Ok(full_id)
    }

    /// Declares a connection between two entities of different simulators.
    pub fn add_connection(
        &mut self,
        src: &FullId,
        dst: &FullId,
        attrs: Vec<(String, String)>,
        delay: DelayKind,
    ) -> Result<(), ConfigurationError> {
        if self.frozen {
            return Err(ConfigurationError::GraphFrozen);
        }
        if src.sid == dst.sid {
            return Err(ConfigurationError::SameSimulator {
                src: src.to_string(),
                dst: dst.to_string(),
            });
        }
        if attrs.is_empty() {
            return Err(ConfigurationError::EmptyConnection {
                src: src.to_string(),
                dst: dst.to_string(),
            });
        }

        let src_model = self.entity_model(src)?;
        let dst_model = self.entity_model(dst)?;
        for (src_attr, dst_attr) in &attrs {
            if !src_model.has_attr(src_attr) {
                return Err(ConfigurationError::UnknownAttribute {
                    entity: src.to_string(),
                    attr: src_attr.clone(),
                    role: "source",
                });
            }
            if !dst_model.accepts_input(dst_attr) {
                return Err(ConfigurationError::UnknownAttribute {
                    entity: dst.to_string(),
                    attr: dst_attr.clone(),
                    role: "destination",
                });
            }
        }

        self.link(src, dst);
        debug!(src = %src, dst = %dst, ?delay, n_attrs = attrs.len(), "Connection added");
        self.connections.push(Connection {
            src: src.clone(),
            dst: dst.clone(),
            attrs,
            delay,
        });
        Ok(())
    }

    fn entity_model(&self, id: &FullId) -> Result<&ModelMeta, ConfigurationError> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| ConfigurationError::UnknownEntity(id.to_string()))?;
        self.model_meta(&entity.sid, &entity.model)
    }

    fn link(&mut self, a: &FullId, b: &FullId) {
        self.adjacency.entry(a.clone()).or_default().insert(b.clone());
        self.adjacency.entry(b.clone()).or_default().insert(a.clone());
    }

    /// Forbids further connections.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn entity(&self, id: &FullId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entities owned by one simulator.
    pub fn entities_of<'a>(&'a self, sid: &'a SimId) -> impl Iterator<Item = &'a Entity> + 'a {
        self.entities.values().filter(move |e| &e.sid == sid)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    fn info(&self, id: &FullId) -> Option<EntityInfo> {
        self.entities.get(id).map(|e| EntityInfo {
            model: e.model.clone(),
            sid: e.sid.clone(),
        })
    }

    /// Entities adjacent to `id`.
    pub fn related_entities(
        &self,
        id: &FullId,
    ) -> Result<BTreeMap<String, EntityInfo>, ConfigurationError> {
        let neighbours = self
            .adjacency
            .get(id)
            .filter(|_| self.entities.contains_key(id))
            .ok_or_else(|| ConfigurationError::UnknownEntity(id.to_string()))?;

        Ok(neighbours
            .iter()
            .filter_map(|n| self.info(n).map(|info| (n.to_string(), info)))
            .collect())
    }

    /// Adjacency for several entities at once, keyed by the queried id.
    pub fn related_entities_many(
        &self,
        ids: &[FullId],
    ) -> Result<BTreeMap<String, BTreeMap<String, EntityInfo>>, ConfigurationError> {
        ids.iter()
            .map(|id| Ok((id.to_string(), self.related_entities(id)?)))
            .collect()
    }

    /// Every entity and every (undirected) edge.
    pub fn snapshot(&self) -> GraphSnapshot {
        let nodes = self
            .entities
            .iter()
            .filter_map(|(id, _)| self.info(id).map(|info| (id.to_string(), info)))
            .collect();
        let edges = self
            .adjacency
            .iter()
            .flat_map(|(a, ns)| ns.iter().filter(move |b| a < *b).map(move |b| (a, b)))
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        GraphSnapshot { nodes, edges }
    }
}

/// A `rel` entry is either a full id or an eid of the same simulator.
fn resolve_rel(sid: &SimId, rel: &str) -> Result<FullId, ConfigurationError> {
    if rel.contains('.') {
        rel.parse()
    } else {
        Ok(FullId::new(sid.clone(), rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> EntityGraph {
        let mut g = EntityGraph::new();
        let grid = SimMeta::builder()
            .model("Grid", ModelMeta::public().with_attrs(["p_slack"]))
            .model("Bus", ModelMeta::hidden().with_attrs(["p", "v"]))
            .build();
        let load = SimMeta::builder()
            .model("Load", ModelMeta::public().with_attrs(["p_out", "v_in"]))
            .model("Logger", ModelMeta::public().accepting_any_inputs())
            .build();
        g.register_simulator(SimId::from("Grid-0"), grid);
        g.register_simulator(SimId::from("Load-0"), load);
        g
    }

    fn pairs(attrs: &[(&str, &str)]) -> Vec<(String, String)> {
        attrs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_descriptors_with_children_and_relations() {
        let mut g = graph();
        let sid = SimId::from("Grid-0");
        let mut bus_2 = EntityDescriptor::new("bus_2", "Bus");
        bus_2.rel.push("bus_1".to_string());
        let desc = EntityDescriptor::new("grid", "Grid")
            .with_children(vec![EntityDescriptor::new("bus_1", "Bus"), bus_2]);

        let top = g.add_descriptors(&sid, &[desc]).unwrap();
        assert_eq!(top, vec![FullId::new("Grid-0", "grid")]);

        let grid = g.entity(&top[0]).unwrap();
        assert_eq!(grid.children.len(), 2);

        let related = g.related_entities(&FullId::new("Grid-0", "bus_2")).unwrap();
        assert!(related.contains_key("Grid-0.grid"));
        assert!(related.contains_key("Grid-0.bus_1"));
        assert_eq!(related["Grid-0.bus_1"].model, "Bus");
    }

    #[test]
    fn test_failed_batch_leaves_graph_untouched() {
        let mut g = graph();
        let sid = SimId::from("Grid-0");
        let mut bus_9 = EntityDescriptor::new("bus_9", "Bus");
        bus_9.rel.push("missing".to_string());
        let grid = EntityDescriptor::new("grid", "Grid").with_children(vec![bus_9]);

        assert!(matches!(
            g.add_descriptors(&sid, &[grid]),
            Err(ConfigurationError::UnknownEntity(id)) if id == "Grid-0.missing"
        ));
        assert!(g.entity(&FullId::new("Grid-0", "bus_9")).is_none());
        assert!(g.entity(&FullId::new("Grid-0", "grid")).is_none());

        // Same ids twice in one batch
        let twice = [EntityDescriptor::new("bus_1", "Bus"), EntityDescriptor::new("bus_1", "Bus")];
        assert!(matches!(
            g.add_descriptors(&sid, &twice),
            Err(ConfigurationError::DuplicateEntity(_))
        ));
        assert_eq!(g.entities().count(), 0);

        // A corrected retry goes through
        let retry = EntityDescriptor::new("bus_9", "Bus");
        assert_eq!(g.add_descriptors(&sid, &[retry]).unwrap().len(), 1);
        assert!(g.snapshot().nodes.contains_key("Grid-0.bus_9"));
    }

    #[test]
    fn test_relation_to_later_sibling_in_batch() {
        let mut g = graph();
        let sid = SimId::from("Grid-0");
        let mut bus_1 = EntityDescriptor::new("bus_1", "Bus");
        bus_1.rel.push("bus_2".to_string());

        g.add_descriptors(&sid, &[bus_1, EntityDescriptor::new("bus_2", "Bus")])
            .unwrap();
        let related = g.related_entities(&FullId::new("Grid-0", "bus_1")).unwrap();
        assert!(related.contains_key("Grid-0.bus_2"));
    }

    #[test]
    fn test_duplicate_and_unknown_model_rejected() {
        let mut g = graph();
        let sid = SimId::from("Load-0");
        g.add_entity(&sid, "l0", "Load", &[]).unwrap();

        assert!(matches!(
            g.add_entity(&sid, "l0", "Load", &[]),
            Err(ConfigurationError::DuplicateEntity(_))
        ));
        assert!(matches!(
            g.add_entity(&sid, "x", "Battery", &[]),
            Err(ConfigurationError::UnknownModel { .. })
        ));
        assert!(matches!(
            g.add_entity(&SimId::from("Nope-0"), "x", "Load", &[]),
            Err(ConfigurationError::UnknownSimulator(_))
        ));
    }

    #[test]
    fn test_connection_attribute_validation() {
        let mut g = graph();
        let load = g.add_entity(&SimId::from("Load-0"), "l0", "Load", &[]).unwrap();
        let log = g.add_entity(&SimId::from("Load-0"), "log", "Logger", &[]).unwrap();
        let bus = g.add_entity(&SimId::from("Grid-0"), "b0", "Bus", &[]).unwrap();

        g.add_connection(&load, &bus, pairs(&[("p_out", "p")]), DelayKind::Immediate)
            .unwrap();

        let err = g
            .add_connection(&load, &bus, pairs(&[("q_out", "p")]), DelayKind::Immediate)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownAttribute { role: "source", .. }));

        let err = g
            .add_connection(&bus, &load, pairs(&[("v", "v_missing")]), DelayKind::Weak)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownAttribute { role: "destination", .. }));

        assert!(matches!(
            g.add_connection(&load, &log, pairs(&[("p_out", "x")]), DelayKind::Immediate),
            Err(ConfigurationError::SameSimulator { .. })
        ));
    }

    #[test]
    fn test_any_inputs_destination_across_simulators() {
        let mut g = graph();
        let log = g.add_entity(&SimId::from("Load-0"), "log", "Logger", &[]).unwrap();
        let bus = g.add_entity(&SimId::from("Grid-0"), "b0", "Bus", &[]).unwrap();
        g.add_connection(&bus, &log, pairs(&[("v", "whatever")]), DelayKind::Weak)
            .unwrap();
        assert_eq!(g.connections().len(), 1);
    }

    #[test]
    fn test_connections_frozen_after_start() {
        let mut g = graph();
        let load = g.add_entity(&SimId::from("Load-0"), "l0", "Load", &[]).unwrap();
        let bus = g.add_entity(&SimId::from("Grid-0"), "b0", "Bus", &[]).unwrap();
        g.freeze();

        let err = g
            .add_connection(&load, &bus, pairs(&[("p_out", "p")]), DelayKind::Immediate)
            .unwrap_err();
        assert_eq!(err, ConfigurationError::GraphFrozen);

        // Entities can still be added lazily
        g.add_entity(&SimId::from("Load-0"), "l1", "Load", &[]).unwrap();
    }

    #[test]
    fn test_snapshot_lists_each_edge_once() {
        let mut g = graph();
        let load = g.add_entity(&SimId::from("Load-0"), "l0", "Load", &[]).unwrap();
        let bus = g.add_entity(&SimId::from("Grid-0"), "b0", "Bus", &[]).unwrap();
        g.add_connection(&load, &bus, pairs(&[("p_out", "p")]), DelayKind::Immediate)
            .unwrap();

        let snap = g.snapshot();
        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(snap.edges, vec![("Grid-0.b0".to_string(), "Load-0.l0".to_string())]);
    }

    #[test]
    fn test_related_entities_unknown_id() {
        let g = graph();
        assert!(matches!(
            g.related_entities(&FullId::new("Grid-0", "nope")),
            Err(ConfigurationError::UnknownEntity(_))
        ));
    }
}
