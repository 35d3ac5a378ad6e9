//! Consumer-side helpers for visual modifiers
//!
//! Modifiers read a node's active state and the time of its last state
//! change, look up the parameters they authored for that state and
//! interpolate towards them. Rendering is up to the consumer; this module
//! only provides the per-state lookup and the transition clock.

use crate::registry::{Registry, StateId};

/// Per-state authored properties
#[derive(Clone, Debug)]
pub struct PropertyTable<P> {
    entries: Vec<(StateId, P)>,
}

impl<P> PropertyTable<P> {
    /// Build a table from `(state name, property)` pairs
    ///
    /// Pairs naming a state unknown to the registry are skipped with a
    /// warning.
    pub fn new<I, S>(registry: &Registry, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .filter_map(|(name, property)| match registry.state_id(name.as_ref()) {
                Some(state) => Some((state, property)),
                None => {
                    tracing::warn!("property table references unknown state {}", name.as_ref());
                    None
                }
            })
            .collect();
        Self { entries }
    }

    /// Build a table directly from state ids
    pub fn from_ids(entries: impl IntoIterator<Item = (StateId, P)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Property for `state`
    ///
    /// A missing state falls back to the first entry with a warning. Returns
    /// `None` only when the table is empty.
    pub fn get(&self, state: StateId) -> Option<&P> {
        if let Some((_, property)) = self.entries.iter().find(|(s, _)| *s == state) {
            return Some(property);
        }

        tracing::warn!("no property for state {}, using the first entry", state);
        self.entries.first().map(|(_, property)| property)
    }

    pub fn contains(&self, state: StateId) -> bool {
        self.entries.iter().any(|(s, _)| *s == state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshot of a node's transition timing
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransitionClock {
    pub active_state: Option<StateId>,
    pub state_change_time: f64,
    pub current_time: f64,
}

impl TransitionClock {
    /// Seconds since the last state change
    pub fn elapsed(&self) -> f64 {
        (self.current_time - self.state_change_time).max(0.0)
    }

    /// Transition progress in `0.0..=1.0` for a transition lasting `duration`
    ///
    /// Zero or negative durations complete immediately.
    pub fn progress(&self, duration: f64) -> f64 {
        if duration <= 0.0 {
            return 1.0;
        }
        (self.elapsed() / duration).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_state("idle");
        registry.register_state("hovered");
        registry.register_state("pressed");
        registry
    }

    #[test]
    fn test_property_lookup() {
        let registry = registry();
        let table = PropertyTable::new(&registry, [("idle", 1.0), ("hovered", 1.2), ("bogus", 9.0)]);
        assert_eq!(table.len(), 2);

        let hovered = registry.state_id("hovered").unwrap();
        assert_eq!(table.get(hovered), Some(&1.2));
    }

    #[test]
    fn test_missing_state_falls_back_to_first() {
        let registry = registry();
        let table = PropertyTable::new(&registry, [("hovered", "blue"), ("idle", "grey")]);
        let pressed = registry.state_id("pressed").unwrap();
        assert!(!table.contains(pressed));
        assert_eq!(table.get(pressed), Some(&"blue"));

        let empty: PropertyTable<u8> = PropertyTable::from_ids([]);
        assert_eq!(empty.get(0), None);
    }

    #[test]
    fn test_clock_progress() {
        let clock = TransitionClock {
            active_state: Some(1),
            state_change_time: 2.0,
            current_time: 2.5,
        };
        assert_eq!(clock.elapsed(), 0.5);
        assert_eq!(clock.progress(1.0), 0.5);
        assert_eq!(clock.progress(0.25), 1.0);
        assert_eq!(clock.progress(0.0), 1.0);

        let before = TransitionClock {
            current_time: 1.0,
            ..clock
        };
        assert_eq!(before.progress(1.0), 0.0);
    }
}
