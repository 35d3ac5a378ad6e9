//! Per-node output overrides
//!
//! An override forces an output field's value regardless of what its gates
//! compute. The table keeps overrides in insertion order and rebuilds its
//! lookup cache after every mutation.

use rustc_hash::FxHashMap;

use crate::error::{DexterityError, Result};
use crate::field::{bool_value, FieldValue};
use crate::registry::{FieldId, FieldType, Registry};

/// A forced value for one output field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputOverride {
    pub field: FieldId,
    pub value: FieldValue,
}

/// Ordered override list with a `field -> index` lookup cache
#[derive(Clone, Debug, Default)]
pub struct OverrideTable {
    overrides: Vec<OutputOverride>,
    cache: FxHashMap<FieldId, usize>,
    revision: u64,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace the override for `field`, returning the previous value
    pub fn set(&mut self, field: FieldId, value: FieldValue) -> Option<FieldValue> {
        if let Some(&index) = self.cache.get(&field) {
            let previous = std::mem::replace(&mut self.overrides[index].value, value);
            self.revision += 1;
            return Some(previous);
        }

        self.overrides.push(OutputOverride { field, value });
        self.rebuild_cache();
        None
    }

    /// Remove the override for `field`, returning its value
    pub fn clear(&mut self, field: FieldId) -> Option<FieldValue> {
        let index = *self.cache.get(&field)?;
        let removed = self.overrides.remove(index);
        self.rebuild_cache();
        Some(removed.value)
    }

    pub fn get(&self, field: FieldId) -> Option<FieldValue> {
        self.cache.get(&field).map(|&i| self.overrides[i].value)
    }

    pub fn contains(&self, field: FieldId) -> bool {
        self.cache.contains_key(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputOverride> {
        self.overrides.iter()
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Incremented on every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn rebuild_cache(&mut self) {
        self.cache.clear();
        for (index, entry) in self.overrides.iter().enumerate() {
            self.cache.insert(entry.field, index);
        }
        self.revision += 1;
    }
}

/// Resolve a boolean override value
///
/// Setting a boolean on a non-boolean field only logs a warning.
pub fn boolean_override(registry: &Registry, field: FieldId, value: bool) -> Result<FieldValue> {
    let definition = registry
        .field_definition(field)
        .ok_or(DexterityError::UnknownFieldId(field))?;
    if definition.field_type != FieldType::Boolean {
        tracing::warn!(
            "setting a boolean override for a non-boolean field {}",
            definition.name
        );
    }
    Ok(bool_value(value))
}

/// Resolve an enum override value by name
///
/// Values outside the declared enum set are rejected.
pub fn enum_override(registry: &Registry, field: FieldId, value: &str) -> Result<FieldValue> {
    let definition = registry
        .field_definition(field)
        .ok_or(DexterityError::UnknownFieldId(field))?;
    if definition.field_type != FieldType::Enum {
        tracing::warn!(
            "setting an enum override for a non-enum field {}",
            definition.name
        );
    }

    definition.enum_index(value).ok_or_else(|| {
        tracing::error!(
            "trying to set enum {} value to {}, but it is not a valid enum value",
            definition.name,
            value
        );
        DexterityError::InvalidEnumValue {
            field: definition.name.clone(),
            value: value.to_string(),
        }
    })
}

/// Validate a raw override value against the field's value domain
pub fn raw_override(registry: &Registry, field: FieldId, value: FieldValue) -> Result<FieldValue> {
    let definition = registry
        .field_definition(field)
        .ok_or(DexterityError::UnknownFieldId(field))?;
    if !definition.accepts(value) {
        return Err(DexterityError::ValueOutOfRange {
            field: definition.name.clone(),
            value,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldDefinition;

    fn registry() -> (Registry, FieldId, FieldId) {
        let mut registry = Registry::new();
        let hover = registry
            .register_field(FieldDefinition::boolean("hover"))
            .unwrap();
        let mode = registry
            .register_field(FieldDefinition::enumeration("mode", ["off", "on", "auto"]))
            .unwrap();
        (registry, hover, mode)
    }

    #[test]
    fn test_set_get_clear() {
        let mut table = OverrideTable::new();
        assert_eq!(table.set(3, 1), None);
        assert_eq!(table.set(5, 0), None);
        assert_eq!(table.get(3), Some(1));
        assert_eq!(table.set(3, 0), Some(1));
        assert_eq!(table.get(3), Some(0));

        assert_eq!(table.clear(3), Some(0));
        assert_eq!(table.get(3), None);
        // cache was rebuilt after removal shifted indices
        assert_eq!(table.get(5), Some(0));
        assert_eq!(table.clear(3), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_revision_tracks_mutations() {
        let mut table = OverrideTable::new();
        let r0 = table.revision();
        table.set(1, 1);
        let r1 = table.revision();
        table.set(1, 0);
        let r2 = table.revision();
        table.clear(1);
        assert!(r0 < r1 && r1 < r2 && r2 < table.revision());
    }

    #[test]
    fn test_enum_override_rejects_unknown_value() {
        let (registry, _, mode) = registry();
        assert_eq!(enum_override(&registry, mode, "auto").unwrap(), 2);
        let err = enum_override(&registry, mode, "turbo").unwrap_err();
        assert!(matches!(err, DexterityError::InvalidEnumValue { .. }));
    }

    #[test]
    fn test_boolean_override_on_enum_is_soft() {
        let (registry, hover, mode) = registry();
        assert_eq!(boolean_override(&registry, hover, true).unwrap(), 1);
        // type mismatch only warns
        assert_eq!(boolean_override(&registry, mode, false).unwrap(), 0);
        assert!(boolean_override(&registry, 99, true).is_err());
    }

    #[test]
    fn test_raw_override_range() {
        let (registry, hover, mode) = registry();
        assert!(raw_override(&registry, hover, 1).is_ok());
        assert!(raw_override(&registry, hover, 2).is_err());
        assert!(raw_override(&registry, mode, 2).is_ok());
        assert!(raw_override(&registry, mode, -1).is_err());
    }
}
