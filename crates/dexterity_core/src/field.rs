//! Designer-level field expressions
//!
//! A [`Field`] describes where a gate's value comes from. Fields are plain
//! data: the runtime instantiates them into graph slots when the owning node
//! is enabled and tears those slots down again when gates change.
//!
//! Values are integers. Booleans are `0`/`1`, enums are indices into the
//! definition's value list and [`EMPTY_FIELD_VALUE`] means "no opinion".

use std::fmt;
use std::sync::Arc;

use crate::node::NodeId;

/// Runtime value of a field
pub type FieldValue = i32;

/// Sentinel for "not yet evaluated / no opinion"
pub const EMPTY_FIELD_VALUE: FieldValue = -1;

/// Value substituted for empty fields when building a state snapshot
pub const DEFAULT_FIELD_VALUE: FieldValue = 0;

/// Convert a boolean into a field value
pub fn bool_value(value: bool) -> FieldValue {
    if value {
        1
    } else {
        0
    }
}

/// Whether a value counts as `true` (empty counts as `false`)
pub fn is_truthy(value: FieldValue) -> bool {
    value > 0
}

/// Boolean negation that keeps empty values empty
pub fn negate_value(value: FieldValue) -> FieldValue {
    if value == EMPTY_FIELD_VALUE {
        value
    } else {
        bool_value(!is_truthy(value))
    }
}

/// A capability that reports a boolean from outside the field graph
///
/// The runtime polls every external source once per tick. Closures
/// returning `bool` implement this trait directly.
pub trait ExternalBooleanSource: Send + Sync {
    fn get(&self) -> bool;
}

impl<F> ExternalBooleanSource for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn get(&self) -> bool {
        self()
    }
}

/// Logical combination operators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
    Xor,
    /// Negates the first upstream value
    Not,
}

impl LogicalOp {
    /// Combine upstream values
    ///
    /// Empty upstream values count as `false`. With no upstream values at
    /// all the result is empty.
    pub fn apply<I>(self, values: I) -> FieldValue
    where
        I: IntoIterator<Item = FieldValue>,
    {
        let mut values = values.into_iter().peekable();
        if values.peek().is_none() {
            return EMPTY_FIELD_VALUE;
        }

        match self {
            LogicalOp::And => bool_value(values.all(is_truthy)),
            LogicalOp::Or => bool_value(values.any(is_truthy)),
            LogicalOp::Xor => bool_value(values.filter(|v| is_truthy(*v)).count() % 2 == 1),
            LogicalOp::Not => bool_value(!values.next().is_some_and(is_truthy)),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
            LogicalOp::Xor => "XOR",
            LogicalOp::Not => "NOT",
        }
    }
}

/// A field expression feeding a gate
#[derive(Clone)]
pub enum Field {
    /// A fixed value
    Constant(FieldValue),
    /// Logical combination of upstream fields
    Logical { op: LogicalOp, upstream: Vec<Field> },
    /// Another node's output field, by field name
    NodeOutput {
        target: NodeId,
        field: String,
        negate: bool,
    },
    /// Whether another node is currently in the named state
    NodeState {
        target: NodeId,
        state: String,
        negate: bool,
    },
    /// A boolean supplied by the host application
    External {
        source: Arc<dyn ExternalBooleanSource>,
        negate: bool,
    },
}

impl Field {
    pub fn constant(value: FieldValue) -> Self {
        Field::Constant(value)
    }

    pub fn boolean(value: bool) -> Self {
        Field::Constant(bool_value(value))
    }

    pub fn and(upstream: impl IntoIterator<Item = Field>) -> Self {
        Field::Logical {
            op: LogicalOp::And,
            upstream: upstream.into_iter().collect(),
        }
    }

    pub fn or(upstream: impl IntoIterator<Item = Field>) -> Self {
        Field::Logical {
            op: LogicalOp::Or,
            upstream: upstream.into_iter().collect(),
        }
    }

    pub fn xor(upstream: impl IntoIterator<Item = Field>) -> Self {
        Field::Logical {
            op: LogicalOp::Xor,
            upstream: upstream.into_iter().collect(),
        }
    }

    pub fn not(field: Field) -> Self {
        Field::Logical {
            op: LogicalOp::Not,
            upstream: vec![field],
        }
    }

    pub fn node_output(target: NodeId, field: impl Into<String>) -> Self {
        Field::NodeOutput {
            target,
            field: field.into(),
            negate: false,
        }
    }

    pub fn node_state(target: NodeId, state: impl Into<String>) -> Self {
        Field::NodeState {
            target,
            state: state.into(),
            negate: false,
        }
    }

    pub fn external(source: Arc<dyn ExternalBooleanSource>) -> Self {
        Field::External {
            source,
            negate: false,
        }
    }

    /// Boolean negation of this field
    pub fn negated(self) -> Self {
        match self {
            Field::NodeOutput {
                target,
                field,
                negate,
            } => Field::NodeOutput {
                target,
                field,
                negate: !negate,
            },
            Field::NodeState {
                target,
                state,
                negate,
            } => Field::NodeState {
                target,
                state,
                negate: !negate,
            },
            Field::External { source, negate } => Field::External {
                source,
                negate: !negate,
            },
            other => Field::not(other),
        }
    }

    /// Direct upstream expressions owned by this field
    pub fn upstream(&self) -> &[Field] {
        match self {
            Field::Logical { upstream, .. } => upstream,
            _ => &[],
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Field::Logical { op, upstream } => f
                .debug_struct("Logical")
                .field("op", op)
                .field("upstream", upstream)
                .finish(),
            Field::NodeOutput {
                target,
                field,
                negate,
            } => f
                .debug_struct("NodeOutput")
                .field("target", target)
                .field("field", field)
                .field("negate", negate)
                .finish(),
            Field::NodeState {
                target,
                state,
                negate,
            } => f
                .debug_struct("NodeState")
                .field("target", target)
                .field("state", state)
                .field("negate", negate)
                .finish(),
            Field::External { negate, .. } => f
                .debug_struct("External")
                .field("negate", negate)
                .finish_non_exhaustive(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bang = |negate: bool| if negate { "!" } else { "" };
        match self {
            Field::Constant(v) => write!(f, "{}", v),
            Field::Logical { op, upstream } => {
                write!(f, "{}(", op.symbol())?;
                for (i, field) in upstream.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            Field::NodeOutput { field, negate, .. } => write!(f, "{}@{}", bang(*negate), field),
            Field::NodeState { state, negate, .. } => {
                write!(f, "{}state({})", bang(*negate), state)
            }
            Field::External { negate, .. } => write!(f, "{}external", bang(*negate)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_ops() {
        assert_eq!(LogicalOp::And.apply([1, 1]), 1);
        assert_eq!(LogicalOp::And.apply([1, 0]), 0);
        assert_eq!(LogicalOp::Or.apply([0, 1]), 1);
        assert_eq!(LogicalOp::Or.apply([0, 0]), 0);
        assert_eq!(LogicalOp::Xor.apply([1, 1, 1]), 1);
        assert_eq!(LogicalOp::Xor.apply([1, 1]), 0);
        assert_eq!(LogicalOp::Not.apply([0]), 1);
        assert_eq!(LogicalOp::Not.apply([1]), 0);
    }

    #[test]
    fn test_logical_empty_handling() {
        // no upstream yet: no opinion
        assert_eq!(LogicalOp::Or.apply([]), EMPTY_FIELD_VALUE);
        // empty upstream counts as false
        assert_eq!(LogicalOp::Or.apply([EMPTY_FIELD_VALUE, 1]), 1);
        assert_eq!(LogicalOp::And.apply([EMPTY_FIELD_VALUE, 1]), 0);
        assert_eq!(LogicalOp::Not.apply([EMPTY_FIELD_VALUE]), 1);
    }

    #[test]
    fn test_negate_value() {
        assert_eq!(negate_value(0), 1);
        assert_eq!(negate_value(1), 0);
        assert_eq!(negate_value(EMPTY_FIELD_VALUE), EMPTY_FIELD_VALUE);
    }

    #[test]
    fn test_negated_wraps_or_flips() {
        let source: Arc<dyn ExternalBooleanSource> = Arc::new(|| true);
        match Field::external(source).negated() {
            Field::External { negate, .. } => assert!(negate),
            other => panic!("unexpected {:?}", other),
        }

        match Field::boolean(true).negated() {
            Field::Logical { op, upstream } => {
                assert_eq!(op, LogicalOp::Not);
                assert_eq!(upstream.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_display() {
        let field = Field::or([Field::boolean(true), Field::not(Field::constant(0))]);
        assert_eq!(field.to_string(), "OR(1, NOT(0))");
    }
}
