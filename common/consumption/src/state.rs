use std::sync::atomic::{AtomicU8, Ordering};

use crate::metrics_consts::ENGINE_STATE;

/// Lifecycle of a `ConsumptionEngine`. Only ever moves forward; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Created,
            1 => EngineState::Running,
            2 => EngineState::ShuttingDown,
            _ => EngineState::Stopped,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell {
    value: AtomicU8,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicU8::new(EngineState::Created as u8),
        }
    }

    pub(crate) fn get(&self) -> EngineState {
        EngineState::from_u8(self.value.load(Ordering::SeqCst))
    }

    /// Move to `next` unless the cell is already there or further along.
    /// Returns the state actually held afterwards.
    pub(crate) fn advance(&self, next: EngineState) -> EngineState {
        let previous = self.value.fetch_max(next as u8, Ordering::SeqCst);
        let current = EngineState::from_u8(previous.max(next as u8));
        if previous < next as u8 {
            metrics::gauge!(ENGINE_STATE).set(f64::from(next as u8));
            tracing::debug!(from = ?EngineState::from_u8(previous), to = ?next, "engine state changed");
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_starts_created() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), EngineState::Created);
    }

    #[test]
    fn test_state_only_moves_forward() {
        let cell = StateCell::new();

        assert_eq!(cell.advance(EngineState::Running), EngineState::Running);
        assert_eq!(cell.advance(EngineState::Stopped), EngineState::Stopped);

        // going back is ignored
        assert_eq!(cell.advance(EngineState::Running), EngineState::Stopped);
        assert_eq!(cell.advance(EngineState::ShuttingDown), EngineState::Stopped);
        assert_eq!(cell.get(), EngineState::Stopped);
    }
}
