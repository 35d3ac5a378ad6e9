//! Nodes and their state machine
//!
//! A node owns a runtime copy of its reference asset, the output fields its
//! gates feed, its override table and the transition bookkeeping that turns
//! state function results into committed state changes.
//!
//! Transition protocol, run once per tick while the node is enabled:
//!
//! 1. When an output field relevant to the state function changed, the
//!    function is evaluated. A result that differs from the pending state
//!    re-schedules the commit at `now + delay(active)`. A result equal to the
//!    active state cancels the pending transition.
//! 2. When a pending state exists and its commit time has been reached, the
//!    node commits it and records the commit time.

use std::sync::Arc;

use indexmap::IndexMap;
use slotmap::new_key_type;

use crate::events::{GateListener, Listeners, StateListener, ValueListener};
use crate::field::FieldValue;
use crate::graph::FieldKey;
use crate::overrides::OverrideTable;
use crate::reference::{NodeReference, RuntimeReference};
use crate::registry::{FieldId, StateId};

new_key_type! {
    /// Unique identifier of a node in a runtime
    pub struct NodeId;
}

/// Active/pending state bookkeeping of a node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransitionState {
    active: Option<StateId>,
    pending: Option<StateId>,
    next_state_change_time: f64,
    state_change_time: f64,
    dirty: bool,
}

impl TransitionState {
    pub fn active(&self) -> Option<StateId> {
        self.active
    }

    pub fn pending(&self) -> Option<StateId> {
        self.pending
    }

    /// Time of the last committed transition
    pub fn state_change_time(&self) -> f64 {
        self.state_change_time
    }

    /// Time at which the pending state commits
    pub fn next_state_change_time(&self) -> f64 {
        self.next_state_change_time
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the dirty flag, returning whether it was set
    pub(crate) fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Set the state the node starts in, without raising a transition
    pub(crate) fn start(&mut self, state: StateId, now: f64) {
        self.active = Some(state);
        self.pending = None;
        self.state_change_time = now;
        self.next_state_change_time = now;
    }

    pub(crate) fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// Feed a freshly evaluated state
    ///
    /// `delay` is the delay configured for leaving the active state.
    pub(crate) fn schedule(&mut self, state: StateId, now: f64, delay: f64) {
        if Some(state) == self.pending {
            return;
        }
        self.next_state_change_time = now + delay;
        self.pending = if Some(state) != self.active {
            Some(state)
        } else {
            None
        };
    }

    /// Commit the pending state once its time has come
    ///
    /// Returns `(old, new)` for a committed transition.
    pub(crate) fn try_commit(&mut self, now: f64) -> Option<(Option<StateId>, StateId)> {
        let pending = self.pending?;
        if self.next_state_change_time > now {
            return None;
        }
        let old = self.active.replace(pending);
        self.pending = None;
        self.state_change_time = now;
        Some((old, pending))
    }
}

/// A runtime node
pub struct Node {
    pub(crate) name: String,
    pub(crate) reference_asset: Option<Arc<NodeReference>>,
    pub(crate) initial_state: Option<String>,
    pub(crate) reference: Option<RuntimeReference>,
    pub(crate) enabled: bool,
    pub(crate) overrides: OverrideTable,
    pub(crate) output_fields: IndexMap<FieldId, FieldKey>,
    pub(crate) non_output_fields: Vec<FieldKey>,
    pub(crate) state_field_ids: Vec<FieldId>,
    pub(crate) transition: TransitionState,
    pub(crate) state_listeners: Listeners<StateListener>,
    pub(crate) value_listeners: Listeners<ValueListener>,
    pub(crate) gate_listeners: Listeners<GateListener>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reference_asset: None,
            initial_state: None,
            reference: None,
            enabled: false,
            overrides: OverrideTable::new(),
            output_fields: IndexMap::new(),
            non_output_fields: Vec::new(),
            state_field_ids: Vec::new(),
            transition: TransitionState::default(),
            state_listeners: Listeners::default(),
            value_listeners: Listeners::default(),
            gate_listeners: Listeners::default(),
        }
    }

    pub fn with_reference(mut self, reference: Arc<NodeReference>) -> Self {
        self.reference_asset = Some(reference);
        self
    }

    pub fn with_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    /// Preset an override; applied as soon as the node is created
    pub fn with_override(mut self, field: FieldId, value: FieldValue) -> Self {
        self.overrides.set(field, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference_asset(&self) -> Option<&Arc<NodeReference>> {
        self.reference_asset.as_ref()
    }

    pub fn initial_state(&self) -> Option<&str> {
        self.initial_state.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn overrides(&self) -> &OverrideTable {
        &self.overrides
    }

    /// Output fields created so far, in creation order
    pub fn output_fields(&self) -> &IndexMap<FieldId, FieldKey> {
        &self.output_fields
    }

    /// Non-output fields currently initialized on behalf of this node
    pub fn non_output_fields(&self) -> &[FieldKey] {
        &self.non_output_fields
    }

    /// Field ids read by the state function
    pub fn state_field_ids(&self) -> &[FieldId] {
        &self.state_field_ids
    }

    pub fn transition(&self) -> &TransitionState {
        &self.transition
    }

    pub fn active_state(&self) -> Option<StateId> {
        self.transition.active
    }

    /// Number of subscribed listeners of every kind
    pub fn listener_count(&self) -> usize {
        self.state_listeners.len() + self.value_listeners.len() + self.gate_listeners.len()
    }

    pub fn gate_count(&self) -> usize {
        self.reference.as_ref().map_or(0, RuntimeReference::len)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("outputs", &self.output_fields.len())
            .field("transition", &self.transition)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: StateId = 0;
    const B: StateId = 1;
    const C: StateId = 2;

    fn started() -> TransitionState {
        let mut state = TransitionState::default();
        state.start(A, 0.0);
        state
    }

    #[test]
    fn test_delayed_commit() {
        let mut state = started();
        state.schedule(B, 0.0, 0.5);
        assert_eq!(state.pending(), Some(B));

        assert_eq!(state.try_commit(0.3), None);
        assert_eq!(state.active(), Some(A));

        assert_eq!(state.try_commit(0.5), Some((Some(A), B)));
        assert_eq!(state.active(), Some(B));
        assert_eq!(state.pending(), None);
        assert_eq!(state.state_change_time(), 0.5);
    }

    #[test]
    fn test_return_to_active_cancels() {
        let mut state = started();
        state.schedule(B, 0.0, 1.0);
        state.schedule(A, 0.2, 1.0);
        assert_eq!(state.pending(), None);
        assert_eq!(state.try_commit(5.0), None);
        assert_eq!(state.active(), Some(A));
    }

    #[test]
    fn test_same_pending_keeps_schedule() {
        let mut state = started();
        state.schedule(B, 0.0, 1.0);
        state.schedule(B, 0.5, 1.0);
        assert_eq!(state.next_state_change_time(), 1.0);

        // a different target restarts the delay
        state.schedule(C, 0.5, 1.0);
        assert_eq!(state.next_state_change_time(), 1.5);
        assert_eq!(state.try_commit(1.0), None);
        assert_eq!(state.try_commit(1.5), Some((Some(A), C)));
    }

    #[test]
    fn test_commit_happens_once() {
        let mut state = started();
        state.schedule(B, 0.0, 0.0);
        assert!(state.try_commit(0.0).is_some());
        assert!(state.try_commit(1.0).is_none());
    }

    #[test]
    fn test_dirty_flag() {
        let mut state = started();
        assert!(!state.take_dirty());
        state.set_dirty();
        assert!(state.is_dirty());
        assert!(state.take_dirty());
        assert!(!state.is_dirty());
    }
}
