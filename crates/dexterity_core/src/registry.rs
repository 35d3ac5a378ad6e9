//! Field and state definition tables
//!
//! The registry resolves designer-facing names to stable integer ids and
//! stores the declared type of every field. It is built once at startup and
//! then shared with the runtime as `Arc<Registry>`, which makes it read-only
//! for the rest of the application's lifetime.
//!
//! ```rust
//! use dexterity_core::registry::{FieldDefinition, Registry};
//!
//! let mut registry = Registry::new();
//! let hover = registry.register_field(FieldDefinition::boolean("hover")).unwrap();
//! let idle = registry.register_state("idle");
//!
//! assert_eq!(registry.field_id("hover"), Some(hover));
//! assert_eq!(registry.state_name(idle), Some("idle"));
//! ```

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DexterityError, Result};
use crate::field::{FieldValue, EMPTY_FIELD_VALUE};

/// Field definition identifier
pub type FieldId = u32;

/// State identifier
pub type StateId = u32;

/// Declared type of a field definition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Boolean,
    Enum,
}

/// A named, typed field definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    /// Value names for enum fields, indexed by field value
    pub enum_values: Vec<String>,
}

impl FieldDefinition {
    /// Create a boolean field definition
    pub fn boolean(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Boolean,
            enum_values: Vec::new(),
        }
    }

    /// Create an enum field definition
    pub fn enumeration<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            field_type: FieldType::Enum,
            enum_values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Index of an enum value name
    pub fn enum_index(&self, value: &str) -> Option<FieldValue> {
        self.enum_values
            .iter()
            .position(|v| v == value)
            .map(|i| i as FieldValue)
    }

    /// Whether `value` lies in this definition's value domain
    pub fn accepts(&self, value: FieldValue) -> bool {
        match self.field_type {
            FieldType::Boolean => value == 0 || value == 1,
            FieldType::Enum => value >= 0 && (value as usize) < self.enum_values.len(),
        }
    }
}

/// Registry of field and state definitions
#[derive(Clone, Debug, Default)]
pub struct Registry {
    fields: Vec<FieldDefinition>,
    field_ids: FxHashMap<String, FieldId>,
    states: Vec<String>,
    state_ids: FxHashMap<String, StateId>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field definition
    ///
    /// Registering the same definition twice returns the existing id.
    /// Registering a different definition under an existing name fails.
    pub fn register_field(&mut self, definition: FieldDefinition) -> Result<FieldId> {
        if let Some(&id) = self.field_ids.get(&definition.name) {
            if self.fields[id as usize] == definition {
                return Ok(id);
            }
            return Err(DexterityError::DuplicateField(definition.name));
        }

        let id = self.fields.len() as FieldId;
        self.field_ids.insert(definition.name.clone(), id);
        self.fields.push(definition);
        Ok(id)
    }

    /// Register a state name, returning its id (idempotent)
    pub fn register_state(&mut self, name: impl Into<String>) -> StateId {
        let name = name.into();
        if let Some(&id) = self.state_ids.get(&name) {
            return id;
        }

        let id = self.states.len() as StateId;
        self.state_ids.insert(name.clone(), id);
        self.states.push(name);
        id
    }

    /// Resolve a field name to its definition id
    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.field_ids.get(name).copied()
    }

    /// Get a field definition by id
    pub fn field_definition(&self, id: FieldId) -> Option<&FieldDefinition> {
        self.fields.get(id as usize)
    }

    /// Resolve a state name to its id
    pub fn state_id(&self, name: &str) -> Option<StateId> {
        self.state_ids.get(name).copied()
    }

    /// Get the name of a state
    pub fn state_name(&self, id: StateId) -> Option<&str> {
        self.states.get(id as usize).map(String::as_str)
    }

    /// Number of registered field definitions
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Number of registered states
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Iterate over all field definitions with their ids
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &FieldDefinition)> {
        self.fields
            .iter()
            .enumerate()
            .map(|(i, def)| (i as FieldId, def))
    }

    /// Render a field value for diagnostics
    pub fn format_value(&self, id: FieldId, value: FieldValue) -> String {
        if value == EMPTY_FIELD_VALUE {
            return "(empty)".to_string();
        }

        match self.field_definition(id) {
            Some(def) if def.field_type == FieldType::Boolean => (value > 0).to_string(),
            Some(def) => def
                .enum_values
                .get(value as usize)
                .cloned()
                .unwrap_or_else(|| value.to_string()),
            None => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = Registry::new();
        let hover = registry
            .register_field(FieldDefinition::boolean("hover"))
            .unwrap();
        let mode = registry
            .register_field(FieldDefinition::enumeration("mode", ["off", "on"]))
            .unwrap();

        assert_ne!(hover, mode);
        assert_eq!(registry.field_id("mode"), Some(mode));
        assert_eq!(registry.field_id("missing"), None);
        assert_eq!(
            registry.field_definition(mode).unwrap().field_type,
            FieldType::Enum
        );
        assert_eq!(registry.field_count(), 2);
    }

    #[test]
    fn test_register_field_is_idempotent() {
        let mut registry = Registry::new();
        let a = registry
            .register_field(FieldDefinition::boolean("hover"))
            .unwrap();
        let b = registry
            .register_field(FieldDefinition::boolean("hover"))
            .unwrap();
        assert_eq!(a, b);

        let conflict = registry.register_field(FieldDefinition::enumeration("hover", ["x"]));
        assert!(matches!(conflict, Err(DexterityError::DuplicateField(_))));
    }

    #[test]
    fn test_states() {
        let mut registry = Registry::new();
        let idle = registry.register_state("idle");
        let pressed = registry.register_state("pressed");
        assert_eq!(registry.register_state("idle"), idle);
        assert_eq!(registry.state_id("pressed"), Some(pressed));
        assert_eq!(registry.state_name(pressed), Some("pressed"));
        assert_eq!(registry.state_id("nope"), None);
        assert_eq!(registry.state_count(), 2);
    }

    #[test]
    fn test_accepts_and_enum_index() {
        let def = FieldDefinition::enumeration("mode", ["off", "on", "auto"]);
        assert_eq!(def.enum_index("auto"), Some(2));
        assert_eq!(def.enum_index("turbo"), None);
        assert!(def.accepts(2));
        assert!(!def.accepts(3));
        assert!(!def.accepts(-1));

        let flag = FieldDefinition::boolean("flag");
        assert!(flag.accepts(1));
        assert!(!flag.accepts(2));
    }

    #[test]
    fn test_format_value() {
        let mut registry = Registry::new();
        let hover = registry
            .register_field(FieldDefinition::boolean("hover"))
            .unwrap();
        let mode = registry
            .register_field(FieldDefinition::enumeration("mode", ["off", "on"]))
            .unwrap();

        assert_eq!(registry.format_value(hover, EMPTY_FIELD_VALUE), "(empty)");
        assert_eq!(registry.format_value(hover, 1), "true");
        assert_eq!(registry.format_value(mode, 1), "on");
        assert_eq!(registry.format_value(mode, 7), "7");
    }
}
