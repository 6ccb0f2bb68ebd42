//! Persisted time-of-week action schedule.
//!
//! Each slot holds `minute-timestamp * 6 + action`, where the timestamp is
//! the weekly 10-second unit count rounded to a whole minute and the action
//! lives in the residue. The evaluator scans the whole table on every run;
//! the table is small and correctness under timing jitter beats scan cost.

use crate::storage::{NvStore, SCHEDULE_SLOTS};

/// No operation.
pub const ACTION_NOP: u16 = 0;
/// Pull the shutter up.
pub const ACTION_UP: u16 = 1;
/// Pull the shutter down.
pub const ACTION_DOWN: u16 = 5;

/// Lookback window for missed events, in 10-second units (5 minutes).
const LOOKBACK_UNITS: u16 = 5 * 6;

/// An action due according to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Up,
    Down,
}

/// Schedule evaluator with single-fire memory.
#[derive(Debug, Default)]
pub struct Schedule {
    last_found: u16,
}

impl Schedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the schedule against the current time.
    ///
    /// `forced_low` widens the window after an external clock correction so
    /// an action falling between the old and new time is not lost; 0 means
    /// no override. Fires at most one action per invocation - the highest
    /// timestamp inside the window - and never refires the remembered
    /// entry. Does nothing until the clock has been set.
    pub fn evaluate<S: NvStore>(
        &mut self,
        store: &S,
        time: u16,
        forced_low: u16,
        clock_is_set: bool,
    ) -> Option<ScheduleAction> {
        if !clock_is_set {
            return None;
        }
        if self.last_found > time || forced_low != 0 {
            // Weekly wrap or an explicit override invalidates the memory.
            self.last_found = 0;
        }

        let time = time / 6 * 6;
        let mut low = if forced_low == 0 { time } else { forced_low };
        low = low.saturating_sub(LOOKBACK_UNITS);
        if self.last_found != 0 && self.last_found > low {
            low = self.last_found;
        }
        let high = time + 5;

        let mut found = 0u16;
        for slot in 0..SCHEDULE_SLOTS {
            let entry = store.schedule_slot(slot);
            if entry == 0 {
                break; // the table is packed; a zero slot ends it
            }
            if entry > low && entry <= high && entry > found {
                found = entry;
            }
        }
        if found == 0 {
            return None;
        }
        self.last_found = found;
        match found % 6 {
            ACTION_UP => Some(ScheduleAction::Up),
            ACTION_DOWN => Some(ScheduleAction::Down),
            _ => None,
        }
    }

    /// Install the factory schedule: weekday pull-up 07:30 and pull-down
    /// 18:15 for Monday through Saturday, the Sunday pull-up one hour
    /// later. Remaining slots are cleared.
    pub fn write_defaults<S: NvStore>(store: &mut S) {
        let mut up = (7 * 60 + 30) * 6 + ACTION_UP;
        let mut down = (18 * 60 + 15) * 6 + ACTION_DOWN;
        let mut slot = 0;
        while slot + 1 < SCHEDULE_SLOTS && slot < 7 * 2 {
            if slot == 6 * 2 {
                up += 60 * 6; // Sunday
            }
            store.set_schedule_slot(slot, up);
            store.set_schedule_slot(slot + 1, down);
            // The step past the final written day is never stored; wrap it so
            // debug builds match release (overflow-checks off) behaviour.
            up = up.wrapping_add(24 * 60 * 6);
            down = down.wrapping_add(24 * 60 * 6);
            slot += 2;
        }
        while slot < SCHEDULE_SLOTS {
            store.set_schedule_slot(slot, 0);
            slot += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    const MONDAY_0730: u16 = (7 * 60 + 30) * 6;

    fn store_with(entries: &[u16]) -> MemStore {
        let mut store = MemStore::new();
        for (slot, &entry) in entries.iter().enumerate() {
            store.set_schedule_slot(slot, entry);
        }
        store
    }

    #[test]
    fn test_fires_once_and_does_not_refire() {
        let store = store_with(&[MONDAY_0730 + ACTION_UP]);
        let mut schedule = Schedule::new();

        assert_eq!(
            schedule.evaluate(&store, MONDAY_0730, 0, true),
            Some(ScheduleAction::Up)
        );
        // One minute later the same entry stays quiet.
        assert_eq!(schedule.evaluate(&store, MONDAY_0730 + 6, 0, true), None);
    }

    #[test]
    fn test_silent_without_valid_clock() {
        let store = store_with(&[MONDAY_0730 + ACTION_UP]);
        let mut schedule = Schedule::new();
        assert_eq!(schedule.evaluate(&store, MONDAY_0730, 0, false), None);
    }

    #[test]
    fn test_forced_low_bound_recovers_missed_action() {
        // Clock jumps from 07:00 to 07:40 over the 07:30 entry.
        let store = store_with(&[MONDAY_0730 + ACTION_UP]);
        let mut schedule = Schedule::new();
        let old = MONDAY_0730 - 30 * 6; // 07:00
        let new = MONDAY_0730 + 10 * 6; // 07:40

        assert_eq!(
            schedule.evaluate(&store, new, old, true),
            Some(ScheduleAction::Up)
        );
        // Exactly once.
        assert_eq!(schedule.evaluate(&store, new, 0, true), None);
    }

    #[test]
    fn test_highest_entry_in_window_wins() {
        let t = MONDAY_0730;
        let store = store_with(&[t - 12 + ACTION_DOWN, t + ACTION_UP]);
        let mut schedule = Schedule::new();
        // Both entries fall in the 5-minute lookback; only the latest fires.
        assert_eq!(
            schedule.evaluate(&store, t, 0, true),
            Some(ScheduleAction::Up)
        );
        assert_eq!(schedule.evaluate(&store, t + 6, 0, true), None);
    }

    #[test]
    fn test_defaults_cover_the_week() {
        let mut store = MemStore::new();
        Schedule::write_defaults(&mut store);

        assert_eq!(store.schedule_slot(0), MONDAY_0730 + ACTION_UP);
        assert_eq!(store.schedule_slot(1), (18 * 60 + 15) * 6 + ACTION_DOWN);
        // Sunday pull-up one hour later than the weekday one.
        let sunday_up = store.schedule_slot(12);
        assert_eq!(sunday_up % 6, ACTION_UP);
        assert_eq!(
            sunday_up,
            (6 * 1440 + 8 * 60 + 30) * 6 + ACTION_UP
        );
        assert_eq!(store.schedule_slot(14), 0);
        assert_eq!(store.schedule_slot(15), 0);
    }
}
