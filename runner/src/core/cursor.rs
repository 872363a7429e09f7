//! Explicit step cursor used by the outer loop to move between steps.

use crate::core::steps::{FIRST_STEP, LAST_STEP};

/// Position of the loop within a cycle.
///
/// The cursor never points below [`FIRST_STEP`]; it is exhausted once it moves
/// past [`LAST_STEP`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCursor {
    position: u8,
}

impl StepCursor {
    /// Cursor for a cycle resuming after `last_completed`.
    ///
    /// A completed merge (or an out-of-range value) starts a fresh cycle.
    pub fn starting_after(last_completed: u8) -> Self {
        let position = if last_completed >= LAST_STEP {
            FIRST_STEP
        } else {
            last_completed + 1
        };
        Self { position }
    }

    pub fn at(step: u8) -> Self {
        Self {
            position: step.clamp(FIRST_STEP, LAST_STEP + 1),
        }
    }

    /// Step to run next, or `None` once the cycle is complete.
    pub fn current(&self) -> Option<u8> {
        (self.position <= LAST_STEP).then_some(self.position)
    }

    pub fn advance(&mut self) {
        self.advance_to(self.position.saturating_add(1));
    }

    pub fn advance_to(&mut self, step: u8) {
        *self = Self::at(step);
    }

    /// Move back one step for a rollback, never below the first step.
    pub fn step_back(&mut self) {
        self.advance_to(self.position.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_after_last_completed_step() {
        assert_eq!(StepCursor::starting_after(0).current(), Some(1));
        assert_eq!(StepCursor::starting_after(4).current(), Some(5));
    }

    #[test]
    fn completed_cycle_restarts_at_first_step() {
        assert_eq!(StepCursor::starting_after(9).current(), Some(1));
        assert_eq!(StepCursor::starting_after(200).current(), Some(1));
    }

    #[test]
    fn advancing_past_last_step_exhausts_cursor() {
        let mut cursor = StepCursor::at(9);
        cursor.advance();
        assert_eq!(cursor.current(), None);
        cursor.advance();
        assert_eq!(cursor.current(), None);
    }

    #[test]
    fn step_back_saturates_at_first_step() {
        let mut cursor = StepCursor::at(2);
        cursor.step_back();
        assert_eq!(cursor.current(), Some(1));
        cursor.step_back();
        assert_eq!(cursor.current(), Some(1));
    }
}
