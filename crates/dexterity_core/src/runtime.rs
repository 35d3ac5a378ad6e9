//! Dexterity runtime
//!
//! The [`Runtime`] owns the field graph and every node. It instantiates gate
//! expressions into graph slots, applies overrides, drives the transition
//! state machines once per [`Runtime::tick`] and dispatches node events.
//!
//! Structural edits (enabling nodes, adding or removing gates, setting
//! overrides) propagate immediately so output values can be read right
//! after the call. State functions are only evaluated by `tick`.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dexterity_core::field::Field;
//! use dexterity_core::gate::Gate;
//! use dexterity_core::node::Node;
//! use dexterity_core::reference::NodeReference;
//! use dexterity_core::registry::{FieldDefinition, Registry};
//! use dexterity_core::runtime::Runtime;
//! use dexterity_core::state_function::StateFunction;
//!
//! let mut registry = Registry::new();
//! let hover = registry.register_field(FieldDefinition::boolean("hover")).unwrap();
//! let idle = registry.register_state("idle");
//! let hovered = registry.register_state("hovered");
//!
//! let function = StateFunction::builder("button")
//!     .when(hovered, [(hover, 1)])
//!     .otherwise(idle)
//!     .build();
//! let reference = NodeReference::new(Arc::new(function))
//!     .with_gate(Gate::new("hover", Field::boolean(true)));
//!
//! let mut runtime = Runtime::new(Arc::new(registry));
//! let node = runtime.create_node(
//!     Node::new("button")
//!         .with_reference(Arc::new(reference))
//!         .with_initial_state("idle"),
//! );
//! runtime.enable_node(node).unwrap();
//!
//! runtime.tick(0.0);
//! assert_eq!(runtime.active_state(node), Some(hovered));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::config::{DexteritySettings, RuntimeConfig};
use crate::error::{DexterityError, Result};
use crate::events::{
    GateChange, GateChangeKind, ListenerId, Listeners, StateChange, Subscription, ValueChange,
};
use crate::field::{Field, FieldValue, EMPTY_FIELD_VALUE};
use crate::gate::{Gate, GateHandle, OverrideType};
use crate::graph::{FieldChange, FieldKey, FieldKind, Graph};
use crate::modifier::TransitionClock;
use crate::node::{Node, NodeId};
use crate::overrides::{boolean_override, enum_override, raw_override};
use crate::reference::RuntimeReference;
use crate::registry::{FieldId, Registry, StateId};
use crate::state_function::{FieldsState, StateFunction};

/// Runtime statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub node_count: usize,
    pub enabled_node_count: usize,
    pub field_count: usize,
    pub output_field_count: usize,
}

/// Owner of the field graph and all nodes
pub struct Runtime {
    registry: Arc<Registry>,
    config: RuntimeConfig,
    state_functions: FxHashMap<String, Arc<StateFunction>>,
    graph: Graph,
    nodes: SlotMap<NodeId, Node>,
    now: f64,
    next_listener_id: u64,
    batch_depth: u32,
    propagating: bool,
    /// Gate edits waiting for dispatch, drained by the outermost notify
    gate_changes: VecDeque<GateChange>,
    notifying_gates: bool,
}

impl Runtime {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            config,
            state_functions: FxHashMap::default(),
            graph: Graph::new(),
            nodes: SlotMap::with_key(),
            now: 0.0,
            next_listener_id: 0,
            batch_depth: 0,
            propagating: false,
            gate_changes: VecDeque::new(),
            notifying_gates: false,
        }
    }

    /// Build a runtime from a settings document
    ///
    /// The registry and every declared state function are built from the
    /// settings. State functions are available through
    /// [`Runtime::state_function`].
    pub fn from_settings(settings: &DexteritySettings) -> Result<Self> {
        let registry = settings.build_registry()?;
        let state_functions = settings.build_state_functions(&registry)?;
        let mut runtime = Self::with_config(Arc::new(registry), settings.runtime.clone());
        runtime.state_functions = state_functions;
        Ok(runtime)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Current time, as passed to the last [`Runtime::tick`]
    pub fn now(&self) -> f64 {
        self.now
    }

    /// A state function loaded from settings, by name
    pub fn state_function(&self, name: &str) -> Option<Arc<StateFunction>> {
        self.state_functions.get(name).cloned()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            node_count: self.nodes.len(),
            enabled_node_count: self.nodes.values().filter(|n| n.enabled).count(),
            field_count: self.graph.len(),
            output_field_count: self.nodes.values().map(|n| n.output_fields.len()).sum(),
        }
    }

    // =========================================================================
    // NODE LIFECYCLE
    // =========================================================================

    /// Add a node; it stays disabled until [`Runtime::enable_node`]
    ///
    /// Overrides preset on the node are applied to freshly created output
    /// fields.
    pub fn create_node(&mut self, node: Node) -> NodeId {
        let preset: Vec<FieldId> = node.overrides.iter().map(|o| o.field).collect();
        let name = node.name.clone();
        let id = self.nodes.insert(node);

        for field in preset {
            if let Err(err) = self.output_field(id, field) {
                tracing::warn!("{}: dropping preset override: {}", name, err);
            }
        }
        tracing::debug!("node {} created", name);
        self.propagate();
        id
    }

    /// Enable a node: instantiate its reference and initialize every gate
    ///
    /// The first enable resolves the initial state. A node without a
    /// reference or state function stays disabled.
    pub fn enable_node(&mut self, id: NodeId) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let now = self.now;
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        if node.enabled {
            return Ok(());
        }

        let Some(asset) = node.reference_asset.clone() else {
            tracing::error!("{}: no reference assigned", node.name);
            return Err(DexterityError::MissingReference(node.name.clone()));
        };
        let Some(reference) = RuntimeReference::instantiate(&asset) else {
            tracing::error!("{}: no state function assigned", node.name);
            return Err(DexterityError::MissingStateFunction(node.name.clone()));
        };
        let function = Arc::clone(reference.state_function());

        if node.transition.active().is_none() {
            let initial = node
                .initial_state
                .as_deref()
                .and_then(|name| registry.state_id(name));
            let state = match initial {
                Some(state) => state,
                None => {
                    let Some(&first) = function.states().first() else {
                        tracing::error!(
                            "{}: state function {} declares no states",
                            node.name,
                            function.name()
                        );
                        return Err(DexterityError::EmptyStateFunction(
                            function.name().to_string(),
                        ));
                    };
                    tracing::warn!("{}: no default state selected, selecting arbitrary", node.name);
                    first
                }
            };
            node.transition.start(state, now);
        }

        node.state_field_ids = function.field_ids().to_vec();
        node.reference = Some(reference);
        node.enabled = true;
        node.transition.set_dirty();
        let active = node.transition.active();
        let state_fields = node.state_field_ids.clone();
        tracing::debug!("node {} enabled", node.name);

        for field in state_fields {
            if let Err(err) = self.output_field(id, field) {
                tracing::warn!("state function reads an unusable field: {}", err);
            }
        }
        self.restart_fields(id);
        self.graph.observe_node_state(id, active);
        self.propagate();
        Ok(())
    }

    /// Disable a node: tear down every non-output field
    ///
    /// Output fields, overrides and the active state are kept. A pending
    /// transition is dropped.
    pub fn disable_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        if !node.enabled {
            return Ok(());
        }
        node.enabled = false;
        node.transition.cancel_pending();
        tracing::debug!("node {} disabled", node.name);

        self.finalize_fields(id);
        if let Some(node) = self.nodes.get_mut(id) {
            node.reference = None;
        }
        self.graph.observe_node_state(id, None);
        self.propagate();
        Ok(())
    }

    /// Disable a node and remove it together with its output fields
    pub fn destroy_node(&mut self, id: NodeId) -> Result<()> {
        self.disable_node(id)?;
        let node = self.nodes.remove(id).ok_or(DexterityError::NodeNotFound)?;

        for &key in node.output_fields.values() {
            self.graph.finalize(key);
            self.graph.remove_node(key);
        }
        tracing::debug!("node {} destroyed", node.name);
        self.propagate();
        Ok(())
    }

    // =========================================================================
    // GATES
    // =========================================================================

    /// Add a gate to an enabled node's runtime reference
    pub fn add_gate(&mut self, id: NodeId, gate: Gate) -> Result<GateHandle> {
        let handle = self.reference_mut(id)?.add_gate(gate);
        self.restart_fields(id);
        self.propagate();
        self.notify_gates(id, GateChangeKind::Added(handle));
        Ok(handle)
    }

    pub fn remove_gate(&mut self, id: NodeId, handle: GateHandle) -> Result<Gate> {
        let gate = self
            .reference_mut(id)?
            .remove_gate(handle)
            .ok_or(DexterityError::GateNotFound)?;
        self.restart_fields(id);
        self.propagate();
        self.notify_gates(id, GateChangeKind::Removed(handle));
        Ok(gate)
    }

    /// Replace every gate of an enabled node
    pub fn replace_gates(&mut self, id: NodeId, gates: Vec<Gate>) -> Result<Vec<GateHandle>> {
        let handles = self.reference_mut(id)?.replace(gates);
        self.restart_fields(id);
        self.propagate();
        self.notify_gates(id, GateChangeKind::Replaced);
        Ok(handles)
    }

    pub fn gate(&self, id: NodeId, handle: GateHandle) -> Option<&Gate> {
        self.nodes.get(id)?.reference.as_ref()?.gate(handle)
    }

    /// Force `field` to `value` through an `Always` constant gate
    ///
    /// Removing the returned gate restores the previous value.
    pub fn push_override_gate(
        &mut self,
        id: NodeId,
        field: FieldId,
        value: FieldValue,
    ) -> Result<GateHandle> {
        let definition = self
            .registry
            .field_definition(field)
            .ok_or(DexterityError::UnknownFieldId(field))?;
        let gate = Gate::always(definition.name.as_str(), Field::constant(value));
        self.add_gate(id, gate)
    }

    /// Feed `field` of `id` from `source_field` of `source`
    pub fn link_output(
        &mut self,
        id: NodeId,
        field: &str,
        source: NodeId,
        source_field: &str,
        override_type: OverrideType,
        negate: bool,
    ) -> Result<GateHandle> {
        let mut upstream = Field::node_output(source, source_field);
        if negate {
            upstream = upstream.negated();
        }
        self.add_gate(id, Gate::new(field, upstream).with_override_type(override_type))
    }

    fn reference_mut(&mut self, id: NodeId) -> Result<&mut RuntimeReference> {
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        let name = &node.name;
        node.reference
            .as_mut()
            .ok_or_else(|| DexterityError::NodeDisabled(name.clone()))
    }

    // =========================================================================
    // OUTPUT FIELDS
    // =========================================================================

    /// Output field of `id` for `field`, created on first access
    pub fn output_field(&mut self, id: NodeId, field: FieldId) -> Result<FieldKey> {
        let node = self.nodes.get(id).ok_or(DexterityError::NodeNotFound)?;
        if let Some(&key) = node.output_fields.get(&field) {
            return Ok(key);
        }

        let definition = self
            .registry
            .field_definition(field)
            .ok_or(DexterityError::UnknownFieldId(field))?;
        let key = self.graph.add_node(
            FieldKind::Output {
                definition: field,
                field_type: definition.field_type,
                override_value: node.overrides.get(field),
            },
            id,
        );
        self.graph.initialize(key);

        if let Some(node) = self.nodes.get_mut(id) {
            node.output_fields.insert(field, key);
            if node.state_field_ids.contains(&field) {
                node.transition.set_dirty();
            }
        }
        Ok(key)
    }

    /// Current value of an output field, `None` if it was never created
    pub fn output_value(&self, id: NodeId, field: FieldId) -> Option<FieldValue> {
        let key = *self.nodes.get(id)?.output_fields.get(&field)?;
        self.graph.value(key)
    }

    pub fn output_value_by_name(&self, id: NodeId, field: &str) -> Option<FieldValue> {
        self.output_value(id, self.registry.field_id(field)?)
    }

    /// Re-evaluate every output field of a node and its state
    pub fn set_node_dirty(&mut self, id: NodeId) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        node.transition.set_dirty();
        for &key in node.output_fields.values() {
            self.graph.set_dirty(key);
        }
        self.propagate();
        Ok(())
    }

    // =========================================================================
    // OVERRIDES
    // =========================================================================

    /// Override a field with a boolean
    ///
    /// A non-boolean field only produces a warning.
    pub fn set_override(&mut self, id: NodeId, field: FieldId, value: bool) -> Result<()> {
        let value = boolean_override(&self.registry, field, value)?;
        self.apply_override(id, field, value)
    }

    /// Override an enum field by value name
    ///
    /// Unknown value names are rejected and the override table is left as
    /// it was.
    pub fn set_enum_override(&mut self, id: NodeId, field: FieldId, value: &str) -> Result<()> {
        let value = enum_override(&self.registry, field, value)?;
        self.apply_override(id, field, value)
    }

    pub fn set_override_raw(&mut self, id: NodeId, field: FieldId, value: FieldValue) -> Result<()> {
        let value = raw_override(&self.registry, field, value)?;
        self.apply_override(id, field, value)
    }

    /// Remove an override, returning whether one was set
    pub fn clear_override(&mut self, id: NodeId, field: FieldId) -> Result<bool> {
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        if node.overrides.clear(field).is_none() {
            tracing::warn!("{}: override for field {} not defined", node.name, field);
            return Ok(false);
        }
        if let Some(&key) = node.output_fields.get(&field) {
            self.graph.set_override(key, None);
        }
        self.propagate();
        Ok(true)
    }

    fn apply_override(&mut self, id: NodeId, field: FieldId, value: FieldValue) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        node.overrides.set(field, value);
        let key = self.output_field(id, field)?;
        self.graph.set_override(key, Some(value));
        self.propagate();
        Ok(())
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Subscribe to committed state changes of a node
    ///
    /// Listeners run in registration order.
    pub fn on_state_changed<F>(&mut self, id: NodeId, listener: F) -> Result<ListenerId>
    where
        F: FnMut(&mut Runtime, StateChange) + 'static,
    {
        let listener_id = self.next_listener_id();
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        node.state_listeners.push(listener_id, Box::new(listener));
        Ok(listener_id)
    }

    /// Subscribe to output value changes of a node
    pub fn on_value_changed<F>(&mut self, id: NodeId, listener: F) -> Result<ListenerId>
    where
        F: FnMut(&mut Runtime, ValueChange) + 'static,
    {
        let listener_id = self.next_listener_id();
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        node.value_listeners.push(listener_id, Box::new(listener));
        Ok(listener_id)
    }

    /// Subscribe to gate list edits of a node
    ///
    /// Edits made by a gate listener are delivered after the current event
    /// has reached every listener.
    pub fn on_gates_changed<F>(&mut self, id: NodeId, listener: F) -> Result<ListenerId>
    where
        F: FnMut(&mut Runtime, GateChange) + 'static,
    {
        let listener_id = self.next_listener_id();
        let node = self.nodes.get_mut(id).ok_or(DexterityError::NodeNotFound)?;
        node.gate_listeners.push(listener_id, Box::new(listener));
        Ok(listener_id)
    }

    pub fn unsubscribe(&mut self, id: NodeId, listener: ListenerId) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.state_listeners.remove(listener)
                    || node.value_listeners.remove(listener)
                    || node.gate_listeners.remove(listener)
            }
            None => false,
        }
    }

    fn next_listener_id(&mut self) -> ListenerId {
        self.next_listener_id += 1;
        ListenerId(self.next_listener_id)
    }

    fn dispatch_state_change(&mut self, change: StateChange) {
        self.dispatch(change.node, change, |node| &mut node.state_listeners);
    }

    fn dispatch_value_change(&mut self, change: ValueChange) {
        self.dispatch(change.node, change, |node| &mut node.value_listeners);
    }

    fn notify_gates(&mut self, id: NodeId, kind: GateChangeKind) {
        self.gate_changes.push_back(GateChange { node: id, kind });
        if self.notifying_gates {
            return;
        }
        self.notifying_gates = true;
        while let Some(change) = self.gate_changes.pop_front() {
            self.dispatch(change.node, change, |node| &mut node.gate_listeners);
        }
        self.notifying_gates = false;
    }

    /// Run the listeners selected by `list` with `event`
    ///
    /// The list is taken out of the node for the duration of the call so
    /// listeners can borrow the runtime mutably.
    fn dispatch<E: Copy + 'static>(
        &mut self,
        id: NodeId,
        event: E,
        list: fn(&mut Node) -> &mut Listeners<Box<dyn FnMut(&mut Runtime, E)>>,
    ) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let mut listeners = list(node).take();
        for Subscription { id: listener_id, listener } in listeners.iter_mut() {
            let cancelled = self
                .nodes
                .get_mut(id)
                .map_or(true, |n| list(n).is_cancelled(*listener_id));
            if !cancelled {
                listener(self, event);
            }
        }
        if let Some(node) = self.nodes.get_mut(id) {
            list(node).restore(listeners);
        }
    }

    // =========================================================================
    // STATE QUERIES
    // =========================================================================

    pub fn active_state(&self, id: NodeId) -> Option<StateId> {
        self.nodes.get(id)?.transition.active()
    }

    pub fn pending_state(&self, id: NodeId) -> Option<StateId> {
        self.nodes.get(id)?.transition.pending()
    }

    /// Time of the last committed transition, `None` before a node ever started
    pub fn state_change_time(&self, id: NodeId) -> Option<f64> {
        let transition = &self.nodes.get(id)?.transition;
        transition.active().map(|_| transition.state_change_time())
    }

    /// Timing snapshot for modifiers driving a transition
    pub fn clock(&self, id: NodeId) -> Option<TransitionClock> {
        let transition = &self.nodes.get(id)?.transition;
        Some(TransitionClock {
            active_state: transition.active(),
            state_change_time: transition.state_change_time(),
            current_time: self.now,
        })
    }

    /// Render the dependency tree feeding an output field
    pub fn describe_field(&self, id: NodeId, field: FieldId) -> Option<String> {
        let key = *self.nodes.get(id)?.output_fields.get(&field)?;
        Some(self.graph.describe(key, |key, _| self.field_label(key)))
    }

    fn field_label(&self, key: FieldKey) -> String {
        let Some(slot) = self.graph.slot(key) else {
            return "<unregistered>".to_string();
        };
        let owner = self.nodes.get(slot.owner()).map_or("<destroyed>", |n| n.name.as_str());
        let bang = |negate: bool| if negate { "!" } else { "" };

        match slot.kind() {
            FieldKind::Output { definition, .. } => {
                let name = self
                    .registry
                    .field_definition(*definition)
                    .map_or("<unknown>", |d| d.name.as_str());
                format!("{}.{}", owner, name)
            }
            FieldKind::Constant(_) => format!("{}:{}", owner, slot.kind().name()),
            FieldKind::Logical(op) => format!("{}:{}", owner, op.symbol()),
            FieldKind::NodeOutput { negate } => format!("{}:{}output", owner, bang(*negate)),
            FieldKind::NodeState { state, negate, .. } => format!(
                "{}:{}state({})",
                owner,
                bang(*negate),
                self.registry.state_name(*state).unwrap_or("<unknown>")
            ),
            FieldKind::External { negate, .. } => {
                format!("{}:{}{}", owner, bang(*negate), slot.kind().name())
            }
        }
    }

    // =========================================================================
    // BATCHING
    // =========================================================================

    /// Run several edits before propagating once
    pub fn batch<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            self.propagate();
        }
        result
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Advance the runtime to `now`
    ///
    /// Polls external sources, settles the field graph, then lets every
    /// enabled node evaluate its state function and commit due transitions.
    pub fn tick(&mut self, now: f64) {
        self.now = now;
        self.graph.poll_external();
        self.propagate();

        let ids: Vec<NodeId> = self.nodes.keys().collect();
        for id in ids {
            self.update_node(id);
        }
        self.propagate();
    }

    fn update_node(&mut self, id: NodeId) {
        let now = self.now;
        let default_value = self.config.default_field_value;
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if !node.enabled {
            return;
        }
        let Some(function) = node.reference.as_ref().map(|r| Arc::clone(r.state_function())) else {
            return;
        };

        if node.transition.take_dirty() {
            let snapshot: FieldsState = node
                .state_field_ids
                .iter()
                .map(|&field| {
                    let value = node
                        .output_fields
                        .get(&field)
                        .and_then(|&key| self.graph.value(key))
                        .filter(|&value| value != EMPTY_FIELD_VALUE)
                        .unwrap_or(default_value);
                    (field, value)
                })
                .collect();

            let Some(state) = function.evaluate(&snapshot) else {
                tracing::warn!(
                    "{}: state function {} is undecidable for {:?}, not updating",
                    node.name,
                    function.name(),
                    snapshot
                );
                // keep evaluating until a state is decidable again
                node.transition.set_dirty();
                return;
            };
            let delay = node
                .transition
                .active()
                .map_or(0.0, |active| function.delay(active));
            node.transition.schedule(state, now, delay);
        }

        let Some((old_state, new_state)) = node.transition.try_commit(now) else {
            return;
        };
        tracing::debug!(
            "{}: {} -> {}",
            node.name,
            old_state
                .and_then(|s| self.registry.state_name(s))
                .unwrap_or("(none)"),
            self.registry.state_name(new_state).unwrap_or("(unknown)")
        );

        self.graph.observe_node_state(id, Some(new_state));
        self.dispatch_state_change(StateChange {
            node: id,
            old_state,
            new_state,
            time: now,
        });
    }

    // =========================================================================
    // PROPAGATION
    // =========================================================================

    /// Settle the field graph, dispatching value changes
    fn propagate(&mut self) {
        if self.propagating || self.batch_depth > 0 {
            return;
        }
        self.propagating = true;

        let passes = self.config.max_flush_passes.max(1);
        for _ in 0..passes {
            let changes = self.graph.flush();
            for change in changes {
                self.handle_change(change);
            }
            if !self.graph.has_dirty() {
                self.propagating = false;
                return;
            }
        }

        self.propagating = false;
        tracing::warn!("field graph did not settle after {} passes", passes);
    }

    fn handle_change(&mut self, change: FieldChange) {
        let Some(node) = self.nodes.get_mut(change.owner) else {
            return;
        };
        if node.state_field_ids.contains(&change.definition) {
            node.transition.set_dirty();
        }
        tracing::trace!(
            "{}: {} {} -> {}",
            node.name,
            change.definition,
            self.registry.format_value(change.definition, change.old_value),
            self.registry.format_value(change.definition, change.new_value)
        );

        self.dispatch_value_change(ValueChange {
            node: change.owner,
            field: change.definition,
            old_value: change.old_value,
            new_value: change.new_value,
        });
    }

    // =========================================================================
    // FIELD INITIALIZATION
    // =========================================================================

    /// Tear down every non-output field and rebuild them from the gate list
    fn restart_fields(&mut self, id: NodeId) {
        self.finalize_fields(id);

        let Some(gates) = self
            .nodes
            .get(id)
            .and_then(|node| node.reference.as_ref())
            .map(RuntimeReference::snapshot)
        else {
            return;
        };
        for (_, gate) in gates {
            self.initialize_gate(id, &gate);
        }
    }

    fn finalize_fields(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let fields = std::mem::take(&mut node.non_output_fields);
        self.teardown(&fields);
    }

    /// Finalize then unregister fields, skipping output fields
    fn teardown(&mut self, fields: &[FieldKey]) {
        for &key in fields {
            if self.graph.slot(key).is_some_and(|s| !s.kind().is_output()) {
                self.graph.finalize(key);
            }
        }
        for &key in fields {
            if self.graph.slot(key).is_some_and(|s| !s.kind().is_output()) {
                self.graph.remove_node(key);
            }
        }
    }

    fn initialize_gate(&mut self, id: NodeId, gate: &Gate) {
        let Some(field) = self.registry.field_id(&gate.output_field_name) else {
            tracing::warn!("gate output field {} is not registered, skipping", gate.output_field_name);
            return;
        };
        let output = match self.output_field(id, field) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!("skipping gate {}: {}", gate, err);
                return;
            }
        };
        let Some(mark) = self.nodes.get(id).map(|n| n.non_output_fields.len()) else {
            return;
        };

        if let Err(err) = self.initialize_field(id, output, Some(gate.override_type), &gate.field) {
            match &err {
                DexterityError::CyclicDependency { .. } => {
                    tracing::error!("tearing down gate {}: {}", gate, err)
                }
                _ => tracing::warn!("tearing down gate {}: {}", gate, err),
            }
            let failed = match self.nodes.get_mut(id) {
                Some(node) => node.non_output_fields.split_off(mark),
                None => return,
            };
            self.teardown(&failed);
        }
    }

    /// Register `field` below `downstream`, then its upstream expressions
    fn initialize_field(
        &mut self,
        id: NodeId,
        downstream: FieldKey,
        policy: Option<OverrideType>,
        field: &Field,
    ) -> Result<()> {
        let kind = self.resolve_field(field)?;
        let key = self.graph.add_node(kind, id);
        if let Some(node) = self.nodes.get_mut(id) {
            node.non_output_fields.push(key);
        }
        self.graph
            .link(downstream, key, policy)
            .map_err(|cycle| self.cycle_error(&cycle))?;

        if let Field::NodeOutput {
            target,
            field: name,
            ..
        } = field
        {
            let definition = self
                .registry
                .field_id(name)
                .ok_or_else(|| DexterityError::UnknownField(name.clone()))?;
            let target_output = self.output_field(*target, definition)?;
            self.graph
                .link(key, target_output, None)
                .map_err(|cycle| self.cycle_error(&cycle))?;
        }

        self.graph.initialize(key);
        for upstream in field.upstream() {
            self.initialize_field(id, key, None, upstream)?;
        }
        Ok(())
    }

    fn resolve_field(&self, field: &Field) -> Result<FieldKind> {
        let kind = match field {
            Field::Constant(value) => FieldKind::Constant(*value),
            Field::Logical { op, .. } => FieldKind::Logical(*op),
            Field::NodeOutput { target, negate, .. } => {
                if !self.nodes.contains_key(*target) {
                    return Err(DexterityError::FieldInitialization(format!(
                        "{} references a node that does not exist",
                        field
                    )));
                }
                FieldKind::NodeOutput { negate: *negate }
            }
            Field::NodeState {
                target,
                state,
                negate,
            } => {
                let target_node = self.nodes.get(*target).ok_or_else(|| {
                    DexterityError::FieldInitialization(format!(
                        "{} references a node that does not exist",
                        field
                    ))
                })?;
                let state = self
                    .registry
                    .state_id(state)
                    .ok_or_else(|| DexterityError::UnknownState(state.clone()))?;
                FieldKind::NodeState {
                    target: *target,
                    state,
                    observed: target_node
                        .enabled
                        .then(|| target_node.transition.active())
                        .flatten(),
                    negate: *negate,
                }
            }
            Field::External { source, negate } => FieldKind::External {
                source: Arc::clone(source),
                negate: *negate,
            },
        };
        Ok(kind)
    }

    fn cycle_error(&self, cycle: &[FieldKey]) -> DexterityError {
        let cycle = cycle
            .iter()
            .map(|&key| self.field_label(key))
            .collect::<Vec<_>>()
            .join(" -> ");
        DexterityError::CyclicDependency { cycle }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("now", &self.now)
            .field("nodes", &self.nodes.len())
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}
