use chrono::{DateTime, Duration, Utc};

use crate::domain::{TIMER_SLOTS, TimerPresets, clamp_preset_minutes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSlot {
    pub index: usize,
    pub duration_seconds: i64,
    pub remaining_seconds: i64,
    pub is_running: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl TimerSlot {
    fn idle(index: usize, duration_seconds: i64) -> Self {
        Self {
            index,
            duration_seconds,
            remaining_seconds: duration_seconds,
            is_running: false,
            last_tick_at: None,
        }
    }

    fn stop(&mut self) {
        self.is_running = false;
        self.last_tick_at = None;
    }

    fn rewind(&mut self) {
        self.stop();
        self.remaining_seconds = self.duration_seconds;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    pub slot_index: usize,
    pub duration_seconds: i64,
}

/// Three independent countdown slots. Runtime state is never persisted;
/// only the durations come from the stored presets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerBank {
    slots: [TimerSlot; TIMER_SLOTS],
}

impl TimerBank {
    pub fn new(presets: &TimerPresets) -> Self {
        Self::from_durations(
            presets
                .as_array()
                .map(|minutes| i64::from(minutes) * 60),
        )
    }

    pub fn from_durations(seconds: [i64; TIMER_SLOTS]) -> Self {
        Self {
            slots: std::array::from_fn(|index| TimerSlot::idle(index, seconds[index].max(1))),
        }
    }

    pub fn slots(&self) -> &[TimerSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&TimerSlot> {
        self.slots.get(index)
    }

    pub fn any_running(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_running)
    }

    /// Changing the duration cancels a running countdown and refills it.
    pub fn set_duration(&mut self, index: usize, minutes: i64) -> Option<u32> {
        let slot = self.slots.get_mut(index)?;
        let minutes = clamp_preset_minutes(minutes);
        slot.duration_seconds = i64::from(minutes) * 60;
        slot.rewind();
        Some(minutes)
    }

    /// Resets only the slots whose duration differs from `presets`.
    pub fn apply_presets(&mut self, presets: &TimerPresets) {
        for index in 0..TIMER_SLOTS {
            let (Some(minutes), Some(duration)) =
                (presets.minutes(index), presets.duration_seconds(index))
            else {
                continue;
            };
            if self.slots[index].duration_seconds != duration {
                self.set_duration(index, i64::from(minutes));
            }
        }
    }

    pub fn toggle(&mut self, index: usize, now: DateTime<Utc>) -> Option<bool> {
        let slot = self.slots.get_mut(index)?;
        if slot.is_running {
            slot.stop();
            return Some(false);
        }

        if slot.remaining_seconds <= 0 {
            slot.remaining_seconds = slot.duration_seconds;
        }
        slot.is_running = true;
        slot.last_tick_at = Some(now);
        Some(true)
    }

    pub fn reset(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) => {
                slot.rewind();
                true
            }
            None => false,
        }
    }

    /// Counts running slots down by the whole seconds elapsed since their
    /// last tick. The unconsumed fraction carries over to the next tick, so
    /// late or early driver wakeups neither lose nor add time.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TimerExpired> {
        let mut expired = Vec::new();

        for slot in self.slots.iter_mut().filter(|slot| slot.is_running) {
            let last_tick = slot.last_tick_at.unwrap_or(now);
            let elapsed = (now - last_tick).num_seconds();
            if elapsed <= 0 {
                continue;
            }

            slot.remaining_seconds -= elapsed;
            slot.last_tick_at = Some(last_tick + Duration::seconds(elapsed));

            if slot.remaining_seconds <= 0 {
                slot.remaining_seconds = 0;
                slot.stop();
                expired.push(TimerExpired {
                    slot_index: slot.index,
                    duration_seconds: slot.duration_seconds,
                });
            }
        }

        expired
    }
}
