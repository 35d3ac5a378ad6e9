//! Dexterity Core Runtime
//!
//! This crate provides the state core of the Dexterity visual state
//! framework:
//!
//! - **Field Graph**: Boolean and enum fields wired into an acyclic dependency graph
//! - **Gates**: Routing of field expressions into a node's named output fields
//! - **Overrides**: Per-node forced output values
//! - **State Functions**: Reduction of output snapshots to a discrete state
//! - **Nodes**: Delayed state transitions with change events
//!
//! Visual modifiers consume the resulting state through [`modifier`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dexterity_core::{
//!     Field, FieldDefinition, Gate, Node, NodeReference, Registry, Runtime, StateFunction,
//! };
//!
//! let mut registry = Registry::new();
//! let press = registry.register_field(FieldDefinition::boolean("press")).unwrap();
//! let idle = registry.register_state("idle");
//! let pressed = registry.register_state("pressed");
//!
//! let function = StateFunction::builder("button")
//!     .when(pressed, [(press, 1)])
//!     .otherwise(idle)
//!     .delay(idle, 0.1)
//!     .build();
//!
//! let mut runtime = Runtime::new(Arc::new(registry));
//! let button = runtime.create_node(
//!     Node::new("button")
//!         .with_reference(Arc::new(NodeReference::new(Arc::new(function))))
//!         .with_initial_state("idle"),
//! );
//! runtime.enable_node(button).unwrap();
//!
//! // Press and hold
//! runtime.set_override(button, press, true).unwrap();
//! runtime.tick(0.0);
//! assert_eq!(runtime.active_state(button), Some(idle));
//!
//! runtime.tick(0.1);
//! assert_eq!(runtime.active_state(button), Some(pressed));
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod field;
pub mod gate;
pub mod graph;
pub mod modifier;
pub mod node;
pub mod overrides;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod state_function;

pub use config::{DexteritySettings, RuntimeConfig};
pub use error::{DexterityError, Result};
pub use events::{GateChange, GateChangeKind, ListenerId, StateChange, ValueChange};
pub use field::{
    ExternalBooleanSource, Field, FieldValue, LogicalOp, DEFAULT_FIELD_VALUE, EMPTY_FIELD_VALUE,
};
pub use gate::{Gate, GateHandle, OverrideType};
pub use graph::{FieldKey, Graph};
pub use modifier::{PropertyTable, TransitionClock};
pub use node::{Node, NodeId, TransitionState};
pub use reference::NodeReference;
pub use registry::{FieldDefinition, FieldId, FieldType, Registry, StateId};
pub use runtime::{Runtime, RuntimeStats};
pub use state_function::StateFunction;
