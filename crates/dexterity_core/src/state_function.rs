//! State functions reduce a snapshot of output-field values to a state
//!
//! A state function is an ordered list of steps. Each step names a state and
//! the field values required to reach it; the first step whose conditions
//! all hold decides the state. A step without conditions always matches and
//! acts as a fallback.
//!
//! ```rust
//! use dexterity_core::state_function::StateFunction;
//!
//! const HOVER: u32 = 0;
//! const PRESS: u32 = 1;
//! const IDLE: u32 = 0;
//! const HOVERED: u32 = 1;
//! const PRESSED: u32 = 2;
//!
//! let function = StateFunction::builder("button")
//!     .when(PRESSED, [(PRESS, 1)])
//!     .when(HOVERED, [(HOVER, 1)])
//!     .otherwise(IDLE)
//!     .delay(PRESSED, 0.1)
//!     .build();
//!
//! assert_eq!(function.evaluate(&[(PRESS, 0), (HOVER, 1)]), Some(HOVERED));
//! assert_eq!(function.field_ids(), &[PRESS, HOVER]);
//! ```

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::field::FieldValue;
use crate::registry::{FieldId, StateId};

/// Snapshot of `(field, value)` pairs handed to a state function
pub type FieldsState = SmallVec<[(FieldId, FieldValue); 8]>;

/// A single `field == value` requirement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Condition {
    pub field: FieldId,
    pub value: FieldValue,
}

/// A state together with the conditions that select it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub conditions: SmallVec<[Condition; 4]>,
    pub state: StateId,
}

impl Step {
    fn matches(&self, snapshot: &[(FieldId, FieldValue)]) -> bool {
        self.conditions.iter().all(|condition| {
            snapshot
                .iter()
                .find(|(field, _)| *field == condition.field)
                .is_some_and(|&(_, value)| value == condition.value)
        })
    }
}

/// Immutable mapping from field snapshots to state ids
#[derive(Clone, Debug)]
pub struct StateFunction {
    name: String,
    steps: Vec<Step>,
    states: Vec<StateId>,
    field_ids: Vec<FieldId>,
    delays: FxHashMap<StateId, f64>,
}

impl StateFunction {
    pub fn builder(name: impl Into<String>) -> StateFunctionBuilder {
        StateFunctionBuilder {
            name: name.into(),
            steps: Vec::new(),
            declared: Vec::new(),
            delays: FxHashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate a snapshot, returning `None` when no step matches
    pub fn evaluate(&self, snapshot: &[(FieldId, FieldValue)]) -> Option<StateId> {
        self.steps
            .iter()
            .find(|step| step.matches(snapshot))
            .map(|step| step.state)
    }

    /// Field definitions read by this function, in first-use order
    pub fn field_ids(&self) -> &[FieldId] {
        &self.field_ids
    }

    /// States this function can produce, in declaration order
    pub fn states(&self) -> &[StateId] {
        &self.states
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn contains_state(&self, state: StateId) -> bool {
        self.states.contains(&state)
    }

    /// Transition delay (seconds) applied while leaving `state`
    pub fn delay(&self, state: StateId) -> f64 {
        self.delays.get(&state).copied().unwrap_or(0.0)
    }
}

/// Builder for [`StateFunction`]
pub struct StateFunctionBuilder {
    name: String,
    steps: Vec<Step>,
    declared: Vec<StateId>,
    delays: FxHashMap<StateId, f64>,
}

impl StateFunctionBuilder {
    /// Declare a state without a step (reachable only through other means)
    pub fn state(mut self, state: StateId) -> Self {
        self.declare(state);
        self
    }

    /// Add a step selecting `state` when every condition holds
    pub fn when<I>(mut self, state: StateId, conditions: I) -> Self
    where
        I: IntoIterator<Item = (FieldId, FieldValue)>,
    {
        self.declare(state);
        self.steps.push(Step {
            conditions: conditions
                .into_iter()
                .map(|(field, value)| Condition { field, value })
                .collect(),
            state,
        });
        self
    }

    /// Add an unconditional fallback step
    pub fn otherwise(self, state: StateId) -> Self {
        self.when(state, [])
    }

    /// Delay applied before leaving `state`
    pub fn delay(mut self, state: StateId, seconds: f64) -> Self {
        self.delays.insert(state, seconds.max(0.0));
        self
    }

    pub fn build(self) -> StateFunction {
        let mut field_ids = Vec::new();
        for condition in self.steps.iter().flat_map(|s| s.conditions.iter()) {
            if !field_ids.contains(&condition.field) {
                field_ids.push(condition.field);
            }
        }

        StateFunction {
            name: self.name,
            steps: self.steps,
            states: self.declared,
            field_ids,
            delays: self.delays,
        }
    }

    fn declare(&mut self, state: StateId) {
        if !self.declared.contains(&state) {
            self.declared.push(state);
        }
    }
}
