//! Field dependency graph
//!
//! Every runtime field lives in one arena slot keyed by [`FieldKey`]. A slot
//! records the fields it reads (`upstream`) and the fields reading it
//! (`downstream`), its cached value and its lifecycle. The graph owns dirty
//! tracking: marking a field dirty schedules it for re-evaluation and
//! `flush` re-evaluates the dirty closure in topological order, pushing
//! changes further downstream only when a value actually changed.
//!
//! Edges are checked on insertion so the graph stays acyclic. A link that
//! would close a loop is rejected with the offending path.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;

use crate::field::{
    bool_value, negate_value, ExternalBooleanSource, FieldValue, LogicalOp, EMPTY_FIELD_VALUE,
};
use crate::gate::{combine, OverrideType};
use crate::node::NodeId;
use crate::registry::{FieldId, FieldType, StateId};

new_key_type! {
    /// Unique identifier of a runtime field slot
    pub struct FieldKey;
}

/// Lifecycle of a field slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Finalized,
}

/// Runtime variant of a field
#[derive(Clone)]
pub enum FieldKind {
    Constant(FieldValue),
    Logical(LogicalOp),
    /// Reads the single upstream output field of another node
    NodeOutput { negate: bool },
    NodeState {
        target: NodeId,
        state: StateId,
        /// Last active state observed on the target node
        observed: Option<StateId>,
        negate: bool,
    },
    External {
        source: Arc<dyn ExternalBooleanSource>,
        negate: bool,
    },
    Output {
        definition: FieldId,
        field_type: FieldType,
        override_value: Option<FieldValue>,
    },
}

impl FieldKind {
    /// Short name of the variant
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Constant(_) => "constant",
            FieldKind::Logical(_) => "logical",
            FieldKind::NodeOutput { .. } => "node-output",
            FieldKind::NodeState { .. } => "node-state",
            FieldKind::External { .. } => "external",
            FieldKind::Output { .. } => "output",
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, FieldKind::Output { .. })
    }
}

impl std::fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Constant(v) => write!(f, "Constant({})", v),
            FieldKind::Logical(op) => write!(f, "Logical({:?})", op),
            FieldKind::NodeOutput { negate } => write!(f, "NodeOutput {{ negate: {} }}", negate),
            FieldKind::NodeState {
                state,
                observed,
                negate,
                ..
            } => write!(
                f,
                "NodeState {{ state: {}, observed: {:?}, negate: {} }}",
                state, observed, negate
            ),
            FieldKind::External { negate, .. } => write!(f, "External {{ negate: {} }}", negate),
            FieldKind::Output {
                definition,
                override_value,
                ..
            } => write!(
                f,
                "Output {{ definition: {}, override: {:?} }}",
                definition, override_value
            ),
        }
    }
}

/// An upstream edge; gate edges into output fields carry their policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub key: FieldKey,
    pub policy: Option<OverrideType>,
}

/// Internal field slot storage
#[derive(Debug)]
pub struct FieldSlot {
    kind: FieldKind,
    owner: NodeId,
    value: FieldValue,
    lifecycle: Lifecycle,
    upstream: SmallVec<[Upstream; 4]>,
    downstream: SmallVec<[FieldKey; 4]>,
}

impl FieldSlot {
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn value(&self) -> FieldValue {
        self.value
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn upstream(&self) -> &[Upstream] {
        &self.upstream
    }

    pub fn downstream(&self) -> &[FieldKey] {
        &self.downstream
    }
}

/// A change of an output field's value produced by a flush
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub key: FieldKey,
    pub owner: NodeId,
    pub definition: FieldId,
    pub old_value: FieldValue,
    pub new_value: FieldValue,
}

/// The field graph
#[derive(Default)]
pub struct Graph {
    fields: SlotMap<FieldKey, FieldSlot>,
    dirty: IndexSet<FieldKey>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Register a new field slot
    pub fn add_node(&mut self, kind: FieldKind, owner: NodeId) -> FieldKey {
        let key = self.fields.insert(FieldSlot {
            kind,
            owner,
            value: EMPTY_FIELD_VALUE,
            lifecycle: Lifecycle::Uninitialized,
            upstream: SmallVec::new(),
            downstream: SmallVec::new(),
        });
        tracing::trace!(?key, "field registered");
        key
    }

    /// Remove a field slot and all of its edges
    ///
    /// Downstream fields are marked dirty. Removing an unknown key logs a
    /// warning and does nothing.
    pub fn remove_node(&mut self, key: FieldKey) -> Option<FieldKind> {
        let Some(slot) = self.fields.remove(key) else {
            tracing::warn!(?key, "removing a field that is not registered");
            return None;
        };

        for up in &slot.upstream {
            if let Some(upstream) = self.fields.get_mut(up.key) {
                upstream.downstream.retain(|d| *d != key);
            }
        }
        for &down in &slot.downstream {
            if let Some(downstream) = self.fields.get_mut(down) {
                downstream.upstream.retain(|u| u.key != key);
                self.dirty.insert(down);
            }
        }
        self.dirty.shift_remove(&key);

        tracing::trace!(?key, "field unregistered");
        Some(slot.kind)
    }

    /// Add an edge `downstream <- upstream`
    ///
    /// Linking is idempotent. If the edge would close a cycle it is not
    /// added and the cycle path (starting and ending at `downstream`) is
    /// returned.
    pub fn link(
        &mut self,
        downstream: FieldKey,
        upstream: FieldKey,
        policy: Option<OverrideType>,
    ) -> Result<(), Vec<FieldKey>> {
        if !self.fields.contains_key(downstream) || !self.fields.contains_key(upstream) {
            tracing::warn!(?downstream, ?upstream, "linking unregistered fields");
            return Ok(());
        }

        if self.fields[downstream]
            .upstream
            .iter()
            .any(|u| u.key == upstream)
        {
            return Ok(());
        }

        if let Some(path) = self.path_upstream(upstream, downstream) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(downstream);
            cycle.extend(path);
            return Err(cycle);
        }

        self.fields[downstream]
            .upstream
            .push(Upstream { key: upstream, policy });
        self.fields[upstream].downstream.push(downstream);
        self.dirty.insert(downstream);
        Ok(())
    }

    /// Mark a field for re-evaluation on the next flush
    pub fn set_dirty(&mut self, key: FieldKey) {
        if self.fields.contains_key(key) {
            self.dirty.insert(key);
        } else {
            tracing::warn!(?key, "marking an unregistered field dirty");
        }
    }

    pub fn is_dirty(&self, key: FieldKey) -> bool {
        self.dirty.contains(&key)
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn contains(&self, key: FieldKey) -> bool {
        self.fields.contains_key(key)
    }

    pub fn slot(&self, key: FieldKey) -> Option<&FieldSlot> {
        self.fields.get(key)
    }

    pub fn value(&self, key: FieldKey) -> Option<FieldValue> {
        self.fields.get(key).map(|slot| slot.value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = FieldKey> + '_ {
        self.fields.keys()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Initialize a field and perform its first evaluation
    ///
    /// Upstream fields that are not registered yet read as empty; the value
    /// is corrected once they initialize and mark this field dirty.
    pub fn initialize(&mut self, key: FieldKey) -> bool {
        let Some(slot) = self.fields.get(key) else {
            return false;
        };
        if slot.lifecycle == Lifecycle::Initialized {
            return true;
        }

        let value = self.compute(key);
        let slot = &mut self.fields[key];
        slot.lifecycle = Lifecycle::Initialized;
        if slot.value != value {
            slot.value = value;
            self.dirty.extend(slot.downstream.iter().copied());
        }
        true
    }

    /// Finalize a field; it is not evaluated again until re-initialized
    pub fn finalize(&mut self, key: FieldKey) {
        if let Some(slot) = self.fields.get_mut(key) {
            slot.lifecycle = Lifecycle::Finalized;
            self.dirty.shift_remove(&key);
        }
    }

    // =========================================================================
    // VALUE SOURCES
    // =========================================================================

    /// Set or clear the override plane of an output field
    pub fn set_override(&mut self, key: FieldKey, value: Option<FieldValue>) {
        if let Some(FieldSlot {
            kind: FieldKind::Output { override_value, .. },
            ..
        }) = self.fields.get_mut(key)
        {
            if *override_value != value {
                *override_value = value;
                self.dirty.insert(key);
            }
        }
    }

    /// Record the active state of `node` on every field watching it
    pub fn observe_node_state(&mut self, node: NodeId, state: Option<StateId>) {
        for (key, slot) in self.fields.iter_mut() {
            if let FieldKind::NodeState {
                target, observed, ..
            } = &mut slot.kind
            {
                if *target == node && *observed != state {
                    *observed = state;
                    self.dirty.insert(key);
                }
            }
        }
    }

    /// Schedule every initialized external field for re-reading
    pub fn poll_external(&mut self) {
        for (key, slot) in self.fields.iter() {
            if slot.lifecycle == Lifecycle::Initialized
                && matches!(slot.kind, FieldKind::External { .. })
            {
                self.dirty.insert(key);
            }
        }
    }

    // =========================================================================
    // EVALUATION
    // =========================================================================

    /// Re-evaluate dirty fields in topological order
    ///
    /// Returns the output fields whose value changed, in evaluation order.
    pub fn flush(&mut self) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        if self.dirty.is_empty() {
            return changes;
        }

        let order = self.affected_order();
        let mut pending: FxHashSet<FieldKey> = self.dirty.drain(..).collect();

        for key in order {
            if !pending.remove(&key) {
                continue;
            }
            let Some(slot) = self.fields.get(key) else {
                continue;
            };
            if slot.lifecycle != Lifecycle::Initialized {
                continue;
            }

            let new_value = self.compute(key);
            let slot = &mut self.fields[key];
            let old_value = slot.value;
            if old_value == new_value {
                continue;
            }
            slot.value = new_value;
            pending.extend(slot.downstream.iter().copied());

            if let FieldKind::Output { definition, .. } = slot.kind {
                changes.push(FieldChange {
                    key,
                    owner: slot.owner,
                    definition,
                    old_value,
                    new_value,
                });
            }
        }

        for key in pending {
            if self.fields.contains_key(key) {
                tracing::error!(
                    ?key,
                    cycle = ?self.find_cycle(key),
                    "field left unevaluated, it sits on a dependency cycle"
                );
            }
        }

        changes
    }

    /// Compute a field's value from its upstream values
    fn compute(&self, key: FieldKey) -> FieldValue {
        let slot = &self.fields[key];
        let upstream_value =
            |up: &Upstream| self.fields.get(up.key).map_or(EMPTY_FIELD_VALUE, |s| s.value);

        match &slot.kind {
            FieldKind::Constant(value) => *value,
            FieldKind::Logical(op) => op.apply(slot.upstream.iter().map(upstream_value)),
            FieldKind::NodeOutput { negate } => {
                let value = slot
                    .upstream
                    .first()
                    .map_or(EMPTY_FIELD_VALUE, upstream_value);
                if *negate {
                    negate_value(value)
                } else {
                    value
                }
            }
            FieldKind::NodeState {
                state,
                observed,
                negate,
                ..
            } => {
                let value = bool_value(*observed == Some(*state));
                if *negate {
                    negate_value(value)
                } else {
                    value
                }
            }
            FieldKind::External { source, negate } => {
                let value = bool_value(source.get());
                if *negate {
                    negate_value(value)
                } else {
                    value
                }
            }
            FieldKind::Output {
                field_type,
                override_value,
                ..
            } => override_value.unwrap_or_else(|| {
                combine(
                    *field_type,
                    slot.upstream.iter().map(|up| {
                        (
                            up.policy.unwrap_or(OverrideType::Additive),
                            upstream_value(up),
                        )
                    }),
                )
            }),
        }
    }

    /// Dirty fields plus everything downstream of them, topologically sorted
    fn affected_order(&self) -> Vec<FieldKey> {
        let mut affected: IndexSet<FieldKey> = IndexSet::new();
        let mut queue: VecDeque<FieldKey> = self.dirty.iter().copied().collect();
        while let Some(key) = queue.pop_front() {
            if !self.fields.contains_key(key) || !affected.insert(key) {
                continue;
            }
            queue.extend(self.fields[key].downstream.iter().copied());
        }

        let mut in_degree: FxHashMap<FieldKey, usize> = affected
            .iter()
            .map(|&key| {
                let degree = self.fields[key]
                    .upstream
                    .iter()
                    .filter(|up| affected.contains(&up.key))
                    .count();
                (key, degree)
            })
            .collect();

        let mut ready: VecDeque<FieldKey> = affected
            .iter()
            .copied()
            .filter(|key| in_degree[key] == 0)
            .collect();
        let mut order = Vec::with_capacity(affected.len());

        while let Some(key) = ready.pop_front() {
            order.push(key);
            for down in &self.fields[key].downstream {
                if let Some(degree) = in_degree.get_mut(down) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*down);
                    }
                }
            }
        }

        order
    }

    // =========================================================================
    // DIAGNOSTICS
    // =========================================================================

    /// Find a dependency cycle through `key`, following upstream edges
    ///
    /// The returned path starts and ends at `key`.
    pub fn find_cycle(&self, key: FieldKey) -> Option<Vec<FieldKey>> {
        let slot = self.fields.get(key)?;
        for up in &slot.upstream {
            if let Some(mut path) = self.path_upstream(up.key, key) {
                path.insert(0, key);
                return Some(path);
            }
        }
        None
    }

    /// Depth-first search for `to` along upstream edges starting at `from`
    ///
    /// Returns the path `from .. to` inclusive.
    fn path_upstream(&self, from: FieldKey, to: FieldKey) -> Option<Vec<FieldKey>> {
        let mut visited = FxHashSet::default();
        let mut path = Vec::new();
        if self.search_upstream(from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn search_upstream(
        &self,
        current: FieldKey,
        target: FieldKey,
        visited: &mut FxHashSet<FieldKey>,
        path: &mut Vec<FieldKey>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }
        path.push(current);
        if current == target {
            return true;
        }
        if let Some(slot) = self.fields.get(current) {
            for up in &slot.upstream {
                if self.search_upstream(up.key, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Render the upstream tree of a field
    ///
    /// `label` names each slot. Fields reached twice are printed once and
    /// referenced afterwards.
    pub fn describe<F>(&self, key: FieldKey, label: F) -> String
    where
        F: Fn(FieldKey, &FieldSlot) -> String,
    {
        let mut out = String::new();
        let mut visited = FxHashSet::default();
        self.describe_into(key, &label, &mut out, "", true, &mut visited);
        out
    }

    fn describe_into<F>(
        &self,
        key: FieldKey,
        label: &F,
        out: &mut String,
        prefix: &str,
        is_last: bool,
        visited: &mut FxHashSet<FieldKey>,
    ) where
        F: Fn(FieldKey, &FieldSlot) -> String,
    {
        let marker = if is_last { "└── " } else { "├── " };
        let Some(slot) = self.fields.get(key) else {
            let _ = writeln!(out, "{}{}<unregistered>", prefix, marker);
            return;
        };

        let first_visit = visited.insert(key);
        let _ = writeln!(
            out,
            "{}{}{} = {}{}",
            prefix,
            marker,
            label(key, slot),
            slot.value,
            if first_visit { "" } else { " (see above)" }
        );
        if !first_visit {
            return;
        }

        let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
        let count = slot.upstream.len();
        for (i, up) in slot.upstream.iter().enumerate() {
            self.describe_into(up.key, label, out, &child_prefix, i + 1 == count, visited);
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("fields", &self.fields.len())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn owner() -> NodeId {
        let mut nodes: SlotMap<NodeId, ()> = SlotMap::with_key();
        nodes.insert(())
    }

    fn output(graph: &mut Graph, node: NodeId) -> FieldKey {
        let key = graph.add_node(
            FieldKind::Output {
                definition: 0,
                field_type: FieldType::Boolean,
                override_value: None,
            },
            node,
        );
        graph.initialize(key);
        key
    }

    fn constant(
        graph: &mut Graph,
        node: NodeId,
        into: FieldKey,
        value: FieldValue,
        policy: OverrideType,
    ) -> FieldKey {
        let key = graph.add_node(FieldKind::Constant(value), node);
        graph.link(into, key, Some(policy)).unwrap();
        graph.initialize(key);
        key
    }

    #[test]
    fn test_output_combines_gates() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);

        constant(&mut graph, node, out, 0, OverrideType::Additive);
        constant(&mut graph, node, out, 1, OverrideType::Additive);
        let changes = graph.flush();

        assert_eq!(graph.value(out), Some(1));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_value, EMPTY_FIELD_VALUE);
        assert_eq!(changes[0].new_value, 1);
    }

    #[test]
    fn test_remove_gate_reverts_value() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);

        constant(&mut graph, node, out, 1, OverrideType::Additive);
        let always = constant(&mut graph, node, out, 0, OverrideType::Always);
        graph.flush();
        assert_eq!(graph.value(out), Some(0));

        graph.finalize(always);
        graph.remove_node(always);
        graph.flush();
        assert_eq!(graph.value(out), Some(1));
    }

    #[test]
    fn test_no_spurious_changes() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);
        constant(&mut graph, node, out, 1, OverrideType::Additive);
        graph.flush();

        graph.set_dirty(out);
        assert!(graph.flush().is_empty());
    }

    #[test]
    fn test_preorder_initialization_is_corrected() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);

        // parent initialized before its upstream exists
        let or = graph.add_node(FieldKind::Logical(LogicalOp::Or), node);
        graph.link(out, or, Some(OverrideType::Additive)).unwrap();
        graph.initialize(or);
        assert_eq!(graph.value(or), Some(EMPTY_FIELD_VALUE));

        let leaf = graph.add_node(FieldKind::Constant(1), node);
        graph.link(or, leaf, None).unwrap();
        graph.initialize(leaf);

        graph.flush();
        assert_eq!(graph.value(or), Some(1));
        assert_eq!(graph.value(out), Some(1));
    }

    #[test]
    fn test_override_plane() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);
        constant(&mut graph, node, out, 1, OverrideType::Additive);
        graph.flush();

        graph.set_override(out, Some(0));
        graph.flush();
        assert_eq!(graph.value(out), Some(0));

        graph.set_override(out, None);
        graph.flush();
        assert_eq!(graph.value(out), Some(1));
    }

    #[test]
    fn test_link_rejects_cycle() {
        let mut graph = Graph::new();
        let node = owner();
        let a = output(&mut graph, node);
        let b = output(&mut graph, node);
        let reference = graph.add_node(FieldKind::NodeOutput { negate: false }, node);

        graph.link(a, reference, Some(OverrideType::Additive)).unwrap();
        graph.link(reference, b, None).unwrap();

        let back = graph.add_node(FieldKind::NodeOutput { negate: false }, node);
        graph.link(b, back, Some(OverrideType::Additive)).unwrap();
        let cycle = graph.link(back, a, None).unwrap_err();

        assert_eq!(cycle.first(), Some(&back));
        assert_eq!(cycle.last(), Some(&back));
        assert!(cycle.contains(&a));
        assert!(cycle.contains(&b));
        assert!(graph.find_cycle(back).is_none());
    }

    #[test]
    fn test_self_link_is_cycle() {
        let mut graph = Graph::new();
        let node = owner();
        let a = output(&mut graph, node);
        assert!(graph.link(a, a, None).is_err());
    }

    #[test]
    fn test_link_is_idempotent() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);
        let leaf = constant(&mut graph, node, out, 1, OverrideType::Additive);
        graph.link(out, leaf, Some(OverrideType::Additive)).unwrap();
        assert_eq!(graph.slot(out).unwrap().upstream().len(), 1);
        assert_eq!(graph.slot(leaf).unwrap().downstream().len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut graph = Graph::new();
        let node = owner();
        let key = graph.add_node(FieldKind::Constant(1), node);
        assert!(graph.remove_node(key).is_some());
        assert!(graph.remove_node(key).is_none());
        graph.set_dirty(key);
        assert!(!graph.has_dirty());
    }

    #[test]
    fn test_finalized_fields_are_not_evaluated() {
        let mut graph = Graph::new();
        let node = owner();
        let key = output(&mut graph, node);
        let before = graph.value(key);
        graph.finalize(key);

        graph.set_override(key, Some(1));
        graph.flush();
        assert_eq!(graph.value(key), before);
        assert_eq!(graph.slot(key).unwrap().lifecycle(), Lifecycle::Finalized);
    }

    #[test]
    fn test_initialize_finalize_round_trip() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);
        let or = graph.add_node(FieldKind::Logical(LogicalOp::Or), node);
        graph.link(out, or, Some(OverrideType::Additive)).unwrap();
        graph.initialize(or);
        let leaf = graph.add_node(FieldKind::Constant(1), node);
        graph.link(or, leaf, None).unwrap();
        graph.initialize(leaf);
        graph.flush();
        let first = graph.value(or);

        graph.finalize(or);
        graph.finalize(leaf);
        graph.initialize(or);
        graph.initialize(leaf);
        graph.flush();
        assert_eq!(graph.value(or), first);
        assert_eq!(graph.value(out), Some(1));
    }

    #[test]
    fn test_external_polling() {
        let mut graph = Graph::new();
        let node = owner();
        let flag = Arc::new(AtomicBool::new(false));
        let source_flag = flag.clone();
        let out = output(&mut graph, node);
        let external = graph.add_node(
            FieldKind::External {
                source: Arc::new(move || source_flag.load(Ordering::SeqCst)),
                negate: false,
            },
            node,
        );
        graph.link(out, external, Some(OverrideType::Additive)).unwrap();
        graph.initialize(external);
        graph.flush();
        assert_eq!(graph.value(out), Some(0));

        flag.store(true, Ordering::SeqCst);
        graph.poll_external();
        let changes = graph.flush();
        assert_eq!(graph.value(out), Some(1));
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_node_state_observation() {
        let mut graph = Graph::new();
        let node = owner();
        let key = graph.add_node(
            FieldKind::NodeState {
                target: node,
                state: 3,
                observed: None,
                negate: false,
            },
            node,
        );
        graph.initialize(key);
        assert_eq!(graph.value(key), Some(0));

        graph.observe_node_state(node, Some(3));
        graph.flush();
        assert_eq!(graph.value(key), Some(1));
    }

    #[test]
    fn test_topological_order_evaluates_once() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);
        // diamond: out <- and <- {leaf, or <- leaf}
        let and = graph.add_node(FieldKind::Logical(LogicalOp::And), node);
        graph.link(out, and, Some(OverrideType::Additive)).unwrap();
        let or = graph.add_node(FieldKind::Logical(LogicalOp::Or), node);
        graph.link(and, or, None).unwrap();
        let leaf = graph.add_node(FieldKind::Constant(1), node);
        graph.link(and, leaf, None).unwrap();
        graph.link(or, leaf, None).unwrap();
        for key in [and, or, leaf] {
            graph.initialize(key);
        }

        let changes = graph.flush();
        assert_eq!(graph.value(out), Some(1));
        // the output changed exactly once
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_describe() {
        let mut graph = Graph::new();
        let node = owner();
        let out = output(&mut graph, node);
        constant(&mut graph, node, out, 1, OverrideType::Additive);
        graph.flush();

        let text = graph.describe(out, |_, slot| slot.kind().name().to_string());
        assert!(text.starts_with("└── output = 1"));
        assert!(text.contains("    └── constant = 1"));
    }
}
