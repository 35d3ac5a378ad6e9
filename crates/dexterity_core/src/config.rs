//! Dexterity settings file handling
//!
//! Field definitions, state names and state functions can be authored in a
//! TOML document instead of being registered in code:
//!
//! ```toml
//! states = ["idle"]
//!
//! [runtime]
//! default_field_value = 0
//! max_flush_passes = 8
//!
//! [[fields]]
//! name = "hover"
//! type = "boolean"
//!
//! [[state_functions]]
//! name = "button"
//! delays = { hovered = 0.25 }
//! steps = [
//!   { state = "hovered", when = { hover = true } },
//!   { state = "idle" },
//! ]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DexterityError, Result};
use crate::field::{bool_value, FieldValue, DEFAULT_FIELD_VALUE};
use crate::registry::{FieldDefinition, FieldType, Registry};
use crate::state_function::StateFunction;

// =============================================================================
// Settings
// =============================================================================

/// Top-level settings document
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DexteritySettings {
    /// Extra state names, registered ahead of those used by state functions
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub state_functions: Vec<StateFunctionConfig>,
}

/// Runtime tuning knobs
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Value substituted for empty fields in state snapshots
    #[serde(default = "default_field_value")]
    pub default_field_value: FieldValue,
    /// Upper bound of propagation passes per tick
    #[serde(default = "default_max_flush_passes")]
    pub max_flush_passes: usize,
}

fn default_field_value() -> FieldValue {
    DEFAULT_FIELD_VALUE
}

fn default_max_flush_passes() -> usize {
    8
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_field_value: default_field_value(),
            max_flush_passes: default_max_flush_passes(),
        }
    }
}

/// A field definition entry
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Enum value names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// A state function entry
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StateFunctionConfig {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// Delay in seconds applied while leaving a state, by state name
    #[serde(default)]
    pub delays: BTreeMap<String, f64>,
}

/// A step entry; an empty `when` table always matches
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StepConfig {
    pub state: String,
    #[serde(default)]
    pub when: BTreeMap<String, ConditionValue>,
}

/// A condition value: boolean, raw index or enum value name
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Index(FieldValue),
    Name(String),
}

impl ConditionValue {
    fn resolve(&self, definition: &FieldDefinition) -> Result<FieldValue> {
        let value = match self {
            ConditionValue::Bool(b) => bool_value(*b),
            ConditionValue::Index(i) => *i,
            ConditionValue::Name(name) => {
                definition
                    .enum_index(name)
                    .ok_or_else(|| DexterityError::InvalidEnumValue {
                        field: definition.name.clone(),
                        value: name.clone(),
                    })?
            }
        };

        if !definition.accepts(value) {
            return Err(DexterityError::ValueOutOfRange {
                field: definition.name.clone(),
                value,
            });
        }
        Ok(value)
    }
}

impl DexteritySettings {
    /// Parse settings from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&content)?;
        tracing::debug!(
            "loaded {} fields and {} state functions from {}",
            settings.fields.len(),
            settings.state_functions.len(),
            path.display()
        );
        Ok(settings)
    }

    /// Serialize settings back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build a registry holding every declared field and state
    ///
    /// States named by state function steps or delays are registered too,
    /// after the explicit `states` list.
    pub fn build_registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();

        for field in &self.fields {
            let definition = match field.field_type {
                FieldType::Boolean => FieldDefinition::boolean(field.name.as_str()),
                FieldType::Enum => {
                    FieldDefinition::enumeration(field.name.as_str(), field.values.iter().cloned())
                }
            };
            registry.register_field(definition)?;
        }

        for state in &self.states {
            registry.register_state(state.as_str());
        }
        for function in &self.state_functions {
            for step in &function.steps {
                registry.register_state(step.state.as_str());
            }
            for state in function.delays.keys() {
                registry.register_state(state.as_str());
            }
        }

        Ok(registry)
    }

    /// Build every state function against `registry`, keyed by name
    pub fn build_state_functions(
        &self,
        registry: &Registry,
    ) -> Result<FxHashMap<String, Arc<StateFunction>>> {
        let mut functions = FxHashMap::default();
        for config in &self.state_functions {
            let function = config.build(registry)?;
            functions.insert(config.name.clone(), Arc::new(function));
        }
        Ok(functions)
    }
}

impl StateFunctionConfig {
    /// Resolve names through `registry` and build the state function
    pub fn build(&self, registry: &Registry) -> Result<StateFunction> {
        let mut builder = StateFunction::builder(self.name.as_str());

        for step in &self.steps {
            let state = registry
                .state_id(&step.state)
                .ok_or_else(|| DexterityError::UnknownState(step.state.clone()))?;

            let mut conditions = Vec::with_capacity(step.when.len());
            for (field_name, value) in &step.when {
                let field = registry
                    .field_id(field_name)
                    .ok_or_else(|| DexterityError::UnknownField(field_name.clone()))?;
                let definition = registry
                    .field_definition(field)
                    .ok_or(DexterityError::UnknownFieldId(field))?;
                conditions.push((field, value.resolve(definition)?));
            }
            builder = builder.when(state, conditions);
        }

        for (name, seconds) in &self.delays {
            let state = registry
                .state_id(name)
                .ok_or_else(|| DexterityError::UnknownState(name.clone()))?;
            builder = builder.state(state).delay(state, *seconds);
        }

        let function = builder.build();
        if function.states().is_empty() {
            return Err(DexterityError::EmptyStateFunction(self.name.clone()));
        }
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
states = ["disabled"]

[runtime]
max_flush_passes = 4

[[fields]]
name = "hover"
type = "boolean"

[[fields]]
name = "press"
type = "boolean"

[[fields]]
name = "mode"
type = "enum"
values = ["off", "on", "auto"]

[[state_functions]]
name = "button"
delays = { hovered = 0.25 }
steps = [
  { state = "disabled", when = { mode = "off" } },
  { state = "pressed", when = { hover = true, press = 1 } },
  { state = "hovered", when = { hover = true } },
  { state = "idle" },
]
"#;

    #[test]
    fn test_parse_settings() {
        let settings = DexteritySettings::from_toml_str(SETTINGS).unwrap();
        assert_eq!(settings.runtime.max_flush_passes, 4);
        assert_eq!(settings.runtime.default_field_value, DEFAULT_FIELD_VALUE);
        assert_eq!(settings.fields.len(), 3);
        assert_eq!(settings.fields[2].values, ["off", "on", "auto"]);
        assert_eq!(settings.state_functions[0].steps.len(), 4);
        assert_eq!(
            settings.state_functions[0].steps[1].when["press"],
            ConditionValue::Index(1)
        );
    }

    #[test]
    fn test_build_registry_and_functions() {
        let settings = DexteritySettings::from_toml_str(SETTINGS).unwrap();
        let registry = settings.build_registry().unwrap();
        assert_eq!(registry.field_count(), 3);
        // explicit states first, then states named by functions
        assert_eq!(registry.state_id("disabled"), Some(0));
        assert!(registry.state_id("idle").is_some());

        let functions = settings.build_state_functions(&registry).unwrap();
        let button = &functions["button"];

        let hover = registry.field_id("hover").unwrap();
        let press = registry.field_id("press").unwrap();
        let mode = registry.field_id("mode").unwrap();
        let hovered = registry.state_id("hovered").unwrap();
        let disabled = registry.state_id("disabled").unwrap();

        assert_eq!(button.evaluate(&[(mode, 1), (hover, 1), (press, 0)]), Some(hovered));
        assert_eq!(button.evaluate(&[(mode, 0), (hover, 1), (press, 0)]), Some(disabled));
        assert_eq!(button.delay(hovered), 0.25);
    }

    #[test]
    fn test_invalid_enum_condition() {
        let settings = DexteritySettings::from_toml_str(
            r#"
[[fields]]
name = "mode"
type = "enum"
values = ["off", "on"]

[[state_functions]]
name = "broken"
steps = [{ state = "idle", when = { mode = "turbo" } }]
"#,
        )
        .unwrap();
        let registry = settings.build_registry().unwrap();
        let err = settings.build_state_functions(&registry).unwrap_err();
        assert!(matches!(err, DexterityError::InvalidEnumValue { .. }));
    }

    #[test]
    fn test_unknown_field_in_condition() {
        let settings = DexteritySettings::from_toml_str(
            r#"
[[state_functions]]
name = "broken"
steps = [{ state = "idle", when = { missing = true } }]
"#,
        )
        .unwrap();
        let registry = settings.build_registry().unwrap();
        let err = settings.build_state_functions(&registry).unwrap_err();
        assert!(matches!(err, DexterityError::UnknownField(name) if name == "missing"));
    }

    #[test]
    fn test_empty_state_function() {
        let settings = DexteritySettings::from_toml_str(
            r#"
[[state_functions]]
name = "empty"
"#,
        )
        .unwrap();
        let registry = settings.build_registry().unwrap();
        assert!(matches!(
            settings.build_state_functions(&registry),
            Err(DexterityError::EmptyStateFunction(_))
        ));
    }

    #[test]
    fn test_round_trip_to_toml() {
        let settings = DexteritySettings::from_toml_str(SETTINGS).unwrap();
        let text = settings.to_toml_string().unwrap();
        let parsed = DexteritySettings::from_toml_str(&text).unwrap();
        assert_eq!(parsed.fields.len(), settings.fields.len());
        assert_eq!(parsed.runtime, settings.runtime);
    }

    #[test]
    fn test_load_missing_file() {
        let err = DexteritySettings::load(Path::new("/nonexistent/dexterity.toml")).unwrap_err();
        assert!(matches!(err, DexterityError::Io(_)));
    }
}
