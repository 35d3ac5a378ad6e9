//! Gates route field expressions into a node's named output fields

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::field::{Field, FieldValue, EMPTY_FIELD_VALUE};
use crate::registry::FieldType;

/// How a gate's value combines with other gates feeding the same output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideType {
    /// The last-added `Always` gate replaces every other contribution
    Always,
    /// Contributions are OR-ed together (boolean outputs)
    #[default]
    Additive,
}

/// Stable identifier of a gate within a node's runtime reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GateHandle(pub(crate) u32);

impl GateHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Binding of a field expression to a named output field
#[derive(Clone, Debug)]
pub struct Gate {
    pub output_field_name: String,
    pub field: Field,
    pub override_type: OverrideType,
}

impl Gate {
    /// Create an additive gate
    pub fn new(output_field_name: impl Into<String>, field: Field) -> Self {
        Self {
            output_field_name: output_field_name.into(),
            field,
            override_type: OverrideType::Additive,
        }
    }

    /// Create a gate that overrides every other gate on the same output
    pub fn always(output_field_name: impl Into<String>, field: Field) -> Self {
        Self {
            output_field_name: output_field_name.into(),
            field,
            override_type: OverrideType::Always,
        }
    }

    pub fn with_override_type(mut self, override_type: OverrideType) -> Self {
        self.override_type = override_type;
        self
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Gate <{}> ({:?})",
            self.output_field_name, self.field, self.override_type
        )
    }
}

/// Combine gate contributions into an output value
///
/// `contributions` must be in gate order. Any `Always` gate wins outright,
/// the last one if there are several. Otherwise boolean outputs OR their
/// additive contributions, treating empty as `false`, and other outputs take
/// the first non-empty contribution. With no contribution carrying a value
/// the result is empty.
pub fn combine<I>(field_type: FieldType, contributions: I) -> FieldValue
where
    I: IntoIterator<Item = (OverrideType, FieldValue)>,
{
    let contributions: SmallVec<[(OverrideType, FieldValue); 4]> =
        contributions.into_iter().collect();

    if let Some(&(_, value)) = contributions
        .iter()
        .rev()
        .find(|(kind, _)| *kind == OverrideType::Always)
    {
        return value;
    }

    let mut additive = contributions
        .iter()
        .map(|&(_, value)| value)
        .filter(|&value| value != EMPTY_FIELD_VALUE)
        .peekable();

    if additive.peek().is_none() {
        return EMPTY_FIELD_VALUE;
    }

    match field_type {
        FieldType::Boolean => {
            if additive.any(|value| value > 0) {
                1
            } else {
                0
            }
        }
        FieldType::Enum => additive.next().unwrap_or(EMPTY_FIELD_VALUE),
    }
}
