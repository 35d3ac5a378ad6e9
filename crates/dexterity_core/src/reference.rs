//! Design-time node references and their per-node runtime copies
//!
//! A [`NodeReference`] is the designer-authored asset: a state function plus
//! the gates that feed it. Many nodes share one reference through an `Arc`.
//! When a node is enabled it instantiates a private [`RuntimeReference`] so
//! that gates added or removed at runtime never touch the shared asset.

use std::sync::Arc;

use crate::gate::{Gate, GateHandle};
use crate::state_function::StateFunction;

/// Shared, designer-authored node asset
#[derive(Clone, Debug, Default)]
pub struct NodeReference {
    pub state_function: Option<Arc<StateFunction>>,
    pub gates: Vec<Gate>,
}

impl NodeReference {
    pub fn new(state_function: Arc<StateFunction>) -> Self {
        Self {
            state_function: Some(state_function),
            gates: Vec::new(),
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn with_gates(mut self, gates: impl IntoIterator<Item = Gate>) -> Self {
        self.gates.extend(gates);
        self
    }
}

/// Per-node mutable copy of a [`NodeReference`]
#[derive(Clone, Debug)]
pub(crate) struct RuntimeReference {
    state_function: Arc<StateFunction>,
    gates: Vec<(GateHandle, Gate)>,
    next_handle: u32,
}

impl RuntimeReference {
    /// Copy the asset's gates; `None` when the asset has no state function
    pub fn instantiate(reference: &NodeReference) -> Option<Self> {
        let state_function = reference.state_function.clone()?;
        let mut instance = Self {
            state_function,
            gates: Vec::with_capacity(reference.gates.len()),
            next_handle: 0,
        };
        for gate in &reference.gates {
            instance.add_gate(gate.clone());
        }
        Some(instance)
    }

    pub fn state_function(&self) -> &Arc<StateFunction> {
        &self.state_function
    }

    pub fn add_gate(&mut self, gate: Gate) -> GateHandle {
        let handle = GateHandle(self.next_handle);
        self.next_handle += 1;
        self.gates.push((handle, gate));
        handle
    }

    pub fn remove_gate(&mut self, handle: GateHandle) -> Option<Gate> {
        let index = self.gates.iter().position(|(h, _)| *h == handle)?;
        Some(self.gates.remove(index).1)
    }

    /// Replace every gate, returning the new handles in order
    pub fn replace(&mut self, gates: Vec<Gate>) -> Vec<GateHandle> {
        self.gates.clear();
        gates.into_iter().map(|gate| self.add_gate(gate)).collect()
    }

    pub fn gate(&self, handle: GateHandle) -> Option<&Gate> {
        self.gates
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, gate)| gate)
    }

    /// Copy of the gate list, used to iterate while the node is mutated
    pub fn snapshot(&self) -> Vec<(GateHandle, Gate)> {
        self.gates.clone()
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;

    fn function() -> Arc<StateFunction> {
        Arc::new(StateFunction::builder("f").otherwise(0).build())
    }

    #[test]
    fn test_instantiate_copies_gates() {
        let asset = NodeReference::new(function())
            .with_gate(Gate::new("hover", Field::boolean(true)))
            .with_gate(Gate::new("press", Field::boolean(false)));

        let mut instance = RuntimeReference::instantiate(&asset).unwrap();
        assert_eq!(instance.len(), 2);

        instance.add_gate(Gate::new("focus", Field::boolean(true)));
        assert_eq!(instance.len(), 3);
        // the shared asset is untouched
        assert_eq!(asset.gates.len(), 2);
    }

    #[test]
    fn test_missing_state_function() {
        let asset = NodeReference::default();
        assert!(RuntimeReference::instantiate(&asset).is_none());
    }

    #[test]
    fn test_handles_are_stable() {
        let mut instance = RuntimeReference::instantiate(&NodeReference::new(function())).unwrap();
        let a = instance.add_gate(Gate::new("a", Field::boolean(true)));
        let b = instance.add_gate(Gate::new("b", Field::boolean(true)));

        assert!(instance.remove_gate(a).is_some());
        assert!(instance.remove_gate(a).is_none());
        assert_eq!(instance.gate(b).map(|g| g.output_field_name.as_str()), Some("b"));

        let handles = instance.replace(vec![Gate::new("c", Field::boolean(false))]);
        assert_eq!(handles.len(), 1);
        assert!(instance.gate(b).is_none());
        assert_ne!(handles[0], a);
    }
}
