//! Node events and listener types

use crate::field::FieldValue;
use crate::gate::GateHandle;
use crate::node::NodeId;
use crate::registry::{FieldId, StateId};
use crate::runtime::Runtime;

/// A committed state transition
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateChange {
    pub node: NodeId,
    pub old_state: Option<StateId>,
    pub new_state: StateId,
    /// Runtime time at which the transition was committed
    pub time: f64,
}

/// A change of an output field's value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueChange {
    pub node: NodeId,
    pub field: FieldId,
    pub old_value: FieldValue,
    pub new_value: FieldValue,
}

/// An edit of a node's gate list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateChange {
    pub node: NodeId,
    pub kind: GateChangeKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateChangeKind {
    Added(GateHandle),
    Removed(GateHandle),
    /// The whole gate list was swapped out
    Replaced,
}

/// Identifier returned by listener registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// Listener for committed state transitions
///
/// Listeners receive the runtime mutably and may add gates, set overrides
/// or subscribe further listeners. Changes made here are picked up by the
/// next propagation pass.
pub type StateListener = Box<dyn FnMut(&mut Runtime, StateChange)>;

/// Listener for output value changes
pub type ValueListener = Box<dyn FnMut(&mut Runtime, ValueChange)>;

/// Listener for gate list edits, run after the node's fields were rebuilt
pub type GateListener = Box<dyn FnMut(&mut Runtime, GateChange)>;

/// Listener list entry
pub(crate) struct Subscription<L> {
    pub id: ListenerId,
    pub listener: L,
}

/// Listener lists that can be taken out for dispatch and merged back
pub(crate) struct Listeners<L> {
    entries: Vec<Subscription<L>>,
    /// Ids of entries currently taken out for dispatch
    in_flight: Vec<ListenerId>,
    /// In-flight ids removed during dispatch
    cancelled: Vec<ListenerId>,
}

impl<L> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            in_flight: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

impl<L> Listeners<L> {
    pub fn push(&mut self, id: ListenerId, listener: L) {
        self.entries.push(Subscription { id, listener });
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.id != id);
        if self.entries.len() != before {
            return true;
        }
        if self.in_flight.contains(&id) && !self.cancelled.contains(&id) {
            self.cancelled.push(id);
            return true;
        }
        false
    }

    /// Take the current entries out for dispatch
    pub fn take(&mut self) -> Vec<Subscription<L>> {
        self.in_flight = self.entries.iter().map(|s| s.id).collect();
        std::mem::take(&mut self.entries)
    }

    /// Put dispatched entries back ahead of listeners added meanwhile
    pub fn restore(&mut self, mut dispatched: Vec<Subscription<L>>) {
        let cancelled = std::mem::take(&mut self.cancelled);
        dispatched.retain(|s| !cancelled.contains(&s.id));
        dispatched.append(&mut self.entries);
        self.entries = dispatched;
        self.in_flight.clear();
    }

    pub fn is_cancelled(&self, id: ListenerId) -> bool {
        self.cancelled.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
