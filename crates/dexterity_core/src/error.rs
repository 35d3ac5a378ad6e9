//! Error types for dexterity_core

use thiserror::Error;

use crate::field::FieldValue;
use crate::registry::FieldId;

/// Errors that can occur while configuring or driving a Dexterity runtime
///
/// None of these abort the tick loop. Operations that fail are rejected
/// locally and the affected node, gate or field degrades on its own.
#[derive(Error, Debug)]
pub enum DexterityError {
    /// A field name could not be resolved through the registry
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// A field definition id is not present in the registry
    #[error("unknown field definition id {0}")]
    UnknownFieldId(FieldId),

    /// A state name could not be resolved through the registry
    #[error("unknown state '{0}'")]
    UnknownState(String),

    /// A field was registered twice with conflicting definitions
    #[error("field '{0}' is already registered with a different definition")]
    DuplicateField(String),

    /// An enum override or condition used a value outside the declared set
    #[error("'{value}' is not a valid value of enum field '{field}'")]
    InvalidEnumValue { field: String, value: String },

    /// A field could not be initialized (its gate is torn down)
    #[error("field initialization failed: {0}")]
    FieldInitialization(String),

    /// Linking a field would close a dependency cycle
    #[error("cyclic field dependency: {cycle}")]
    CyclicDependency { cycle: String },

    /// The node id does not refer to a live node
    #[error("node not found")]
    NodeNotFound,

    /// The gate handle does not refer to a gate of the node
    #[error("gate not found")]
    GateNotFound,

    /// The operation needs an enabled node
    #[error("node '{0}' is not enabled")]
    NodeDisabled(String),

    /// The node has no reference asset assigned
    #[error("node '{0}' has no reference assigned")]
    MissingReference(String),

    /// The node's reference has no state function
    #[error("node '{0}' has no state function assigned")]
    MissingStateFunction(String),

    /// The state function declares no states at all
    #[error("state function '{0}' declares no states")]
    EmptyStateFunction(String),

    /// A raw value does not fit the field definition
    #[error("value {value} is out of range for field '{field}'")]
    ValueOutOfRange { field: String, value: FieldValue },

    /// Settings file could not be read
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file could not be parsed
    #[error("invalid settings: {0}")]
    Config(#[from] toml::de::Error),

    /// Settings could not be serialized
    #[error("failed to serialize settings: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// Result type for dexterity_core operations
pub type Result<T> = std::result::Result<T, DexterityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DexterityError::InvalidEnumValue {
            field: "mode".to_string(),
            value: "turbo".to_string(),
        };
        assert!(err.to_string().contains("mode"));
        assert!(err.to_string().contains("turbo"));

        let err = DexterityError::CyclicDependency {
            cycle: "a.hover -> b.hover -> a.hover".to_string(),
        };
        assert!(err.to_string().contains("a.hover -> b.hover"));
    }

    #[test]
    fn test_config_error_from_toml() {
        let parse: std::result::Result<toml::Value, _> = toml::from_str("fields = [");
        let err: DexterityError = parse.unwrap_err().into();
        assert!(matches!(err, DexterityError::Config(_)));
    }
}
