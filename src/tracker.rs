use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::calendar::{DayCalendar, split_by_local_day};
use crate::domain::Ledger;

/// Turns foreground/suspend/resume events into per-day usage seconds.
///
/// At most one session is open at a time. Every transition flushes the
/// open session into the ledger before the next one starts, so time is
/// credited exactly once. Each method returns whether the ledger changed.
pub struct SessionTracker {
    calendar: Arc<dyn DayCalendar>,
    current_target: Option<String>,
    session_start: Option<DateTime<Utc>>,
    paused: bool,
}

impl SessionTracker {
    pub fn new(calendar: Arc<dyn DayCalendar>) -> Self {
        Self {
            calendar,
            current_target: None,
            session_start: None,
            paused: false,
        }
    }

    pub fn current_target(&self) -> Option<&str> {
        self.current_target.as_deref()
    }

    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.session_start
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn on_target_changed(
        &mut self,
        ledger: &mut Ledger,
        target: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.paused {
            return false;
        }

        let changed = self.flush(ledger, now);
        self.current_target = target
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        self.session_start = Some(now);
        changed
    }

    pub fn on_suspend(&mut self, ledger: &mut Ledger, now: DateTime<Utc>) -> bool {
        if self.paused {
            return false;
        }

        let changed = self.flush(ledger, now);
        self.paused = true;
        self.current_target = None;
        self.session_start = None;
        changed
    }

    pub fn on_resume(
        &mut self,
        ledger: &mut Ledger,
        active_target: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.paused {
            return false;
        }

        self.paused = false;
        self.on_target_changed(ledger, active_target, now)
    }

    pub fn on_heartbeat(&mut self, ledger: &mut Ledger, now: DateTime<Utc>) -> bool {
        self.flush(ledger, now)
    }

    /// Flushes and closes the open session without pausing.
    pub fn stop(&mut self, ledger: &mut Ledger, now: DateTime<Utc>) -> bool {
        let changed = self.flush(ledger, now);
        self.current_target = None;
        self.session_start = None;
        changed
    }

    fn flush(&mut self, ledger: &mut Ledger, now: DateTime<Utc>) -> bool {
        if self.paused {
            return false;
        }
        let Some(start) = self.session_start else {
            return false;
        };
        if now <= start {
            return false;
        }
        self.session_start = Some(now);

        let Some(target) = self.current_target.as_deref() else {
            return false;
        };
        // Untracked time is dropped for good; the start still advances so
        // tracking the target later never credits it retroactively.
        if !ledger.is_tracked(target) {
            return false;
        }

        let mut changed = false;
        for slice in split_by_local_day(start, now, self.calendar.as_ref()) {
            changed |= ledger.add_usage(slice.day, target, slice.seconds);
        }
        debug!(target_id = target, %start, end = %now, "session flushed");
        changed
    }
}
