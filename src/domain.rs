use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use serde::{Deserialize, Serialize};

pub const TIMER_SLOTS: usize = 3;
pub const DEFAULT_PRESET_MINUTES: [u32; TIMER_SLOTS] = [60, 30, 15];
pub const MIN_PRESET_MINUTES: u32 = 1;
pub const MAX_PRESET_MINUTES: u32 = 24 * 60;

const ID_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTarget {
    pub bundle_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRecord {
    #[serde(default)]
    pub app_seconds: BTreeMap<String, f64>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub memo: String,
}

impl DayRecord {
    pub fn is_empty(&self) -> bool {
        self.app_seconds.is_empty() && self.tasks.is_empty() && self.memo.is_empty()
    }
}

/// Minutes for each of the timer slots, always within
/// `MIN_PRESET_MINUTES..=MAX_PRESET_MINUTES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPresets([u32; TIMER_SLOTS]);

impl TimerPresets {
    pub fn new(minutes: [u32; TIMER_SLOTS]) -> Self {
        Self(minutes.map(|value| clamp_preset_minutes(i64::from(value))))
    }

    /// Builds presets from the optional stored list. Missing entries keep
    /// their defaults and extra entries are ignored.
    pub fn from_stored(stored: Option<&[i64]>) -> Self {
        let mut presets = Self::default();
        if let Some(stored) = stored {
            for (slot, minutes) in presets.0.iter_mut().zip(stored) {
                *slot = clamp_preset_minutes(*minutes);
            }
        }
        presets
    }

    pub fn minutes(&self, index: usize) -> Option<u32> {
        self.0.get(index).copied()
    }

    pub fn duration_seconds(&self, index: usize) -> Option<i64> {
        self.minutes(index).map(|minutes| i64::from(minutes) * 60)
    }

    pub fn as_array(&self) -> [u32; TIMER_SLOTS] {
        self.0
    }

    /// Stores the clamped value and returns it, or `None` for an unknown slot.
    pub fn set(&mut self, index: usize, minutes: i64) -> Option<u32> {
        let slot = self.0.get_mut(index)?;
        *slot = clamp_preset_minutes(minutes);
        Some(*slot)
    }
}

impl Default for TimerPresets {
    fn default() -> Self {
        Self(DEFAULT_PRESET_MINUTES)
    }
}

pub fn clamp_preset_minutes(minutes: i64) -> u32 {
    minutes.clamp(i64::from(MIN_PRESET_MINUTES), i64::from(MAX_PRESET_MINUTES)) as u32
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRow {
    pub target: TrackedTarget,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub day: NaiveDate,
    pub rows: Vec<UsageRow>,
    pub total_seconds: f64,
}

/// The whole persisted state of the companion.
///
/// Mutators return whether anything changed so the owner knows when a
/// write has to be scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    pub(crate) tracked_targets: Vec<TrackedTarget>,
    pub(crate) days: BTreeMap<NaiveDate, DayRecord>,
    pub(crate) timer_presets: TimerPresets,
    pub(crate) background_image: Option<String>,
    pub(crate) selected_app_icon_id: Option<String>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            tracked_targets: Vec::new(),
            days: BTreeMap::new(),
            timer_presets: TimerPresets::default(),
            background_image: None,
            selected_app_icon_id: None,
        }
    }

    pub fn tracked_targets(&self) -> &[TrackedTarget] {
        &self.tracked_targets
    }

    pub fn is_tracked(&self, bundle_id: &str) -> bool {
        self.tracked_targets
            .iter()
            .any(|target| target.bundle_id == bundle_id)
    }

    pub fn add_tracked_target(&mut self, bundle_id: &str, display_name: &str) -> bool {
        let bundle_id = bundle_id.trim();
        if bundle_id.is_empty() {
            return false;
        }

        let display_name = match display_name.trim() {
            "" => bundle_id,
            name => name,
        };

        match self
            .tracked_targets
            .iter_mut()
            .find(|target| target.bundle_id == bundle_id)
        {
            Some(target) => target.display_name = display_name.to_string(),
            None => self.tracked_targets.push(TrackedTarget {
                bundle_id: bundle_id.to_string(),
                display_name: display_name.to_string(),
            }),
        }

        self.tracked_targets.sort_by(|left, right| {
            left.display_name
                .to_lowercase()
                .cmp(&right.display_name.to_lowercase())
                .then_with(|| left.bundle_id.cmp(&right.bundle_id))
        });
        true
    }

    /// Usage already recorded for the target stays in place.
    pub fn remove_tracked_target(&mut self, bundle_id: &str) -> bool {
        let before = self.tracked_targets.len();
        self.tracked_targets
            .retain(|target| target.bundle_id != bundle_id);
        self.tracked_targets.len() != before
    }

    pub fn days(&self) -> &BTreeMap<NaiveDate, DayRecord> {
        &self.days
    }

    pub fn day(&self, day: NaiveDate) -> Option<&DayRecord> {
        self.days.get(&day)
    }

    pub fn app_seconds(&self, day: NaiveDate) -> BTreeMap<String, f64> {
        self.day(day)
            .map(|record| record.app_seconds.clone())
            .unwrap_or_default()
    }

    pub fn usage_report(&self, day: NaiveDate) -> UsageReport {
        let seconds = self.app_seconds(day);
        let mut rows = self
            .tracked_targets
            .iter()
            .map(|target| UsageRow {
                target: target.clone(),
                seconds: seconds.get(&target.bundle_id).copied().unwrap_or(0.0),
            })
            .collect::<Vec<_>>();

        rows.sort_by(|left, right| {
            right
                .seconds
                .total_cmp(&left.seconds)
                .then_with(|| {
                    left.target
                        .display_name
                        .to_lowercase()
                        .cmp(&right.target.display_name.to_lowercase())
                })
        });
        let total_seconds = rows.iter().map(|row| row.seconds).sum();

        UsageReport {
            day,
            rows,
            total_seconds,
        }
    }

    pub fn total_seconds(&self) -> f64 {
        self.days
            .values()
            .flat_map(|record| record.app_seconds.values())
            .sum()
    }

    pub fn add_usage(&mut self, day: NaiveDate, bundle_id: &str, seconds: f64) -> bool {
        if !seconds.is_finite() || seconds <= 0.0 {
            return false;
        }

        *self
            .days
            .entry(day)
            .or_default()
            .app_seconds
            .entry(bundle_id.to_string())
            .or_insert(0.0) += seconds;
        true
    }

    pub fn tasks(&self, day: NaiveDate) -> &[Task] {
        self.day(day)
            .map(|record| record.tasks.as_slice())
            .unwrap_or(&[])
    }

    pub fn open_tasks(&self, day: NaiveDate) -> Vec<&Task> {
        self.tasks(day)
            .iter()
            .filter(|task| !task.is_completed)
            .collect()
    }

    pub fn completed_tasks(&self, day: NaiveDate) -> Vec<&Task> {
        self.tasks(day)
            .iter()
            .filter(|task| task.is_completed)
            .collect()
    }

    /// Inserts a task at the front of the day's list and returns its id.
    /// Blank titles are ignored.
    pub fn add_task(&mut self, day: NaiveDate, title: &str, now: DateTime<Utc>) -> Option<String> {
        let title = title.trim();
        if title.is_empty() {
            return None;
        }

        let id = generate_id();
        self.days.entry(day).or_default().tasks.insert(
            0,
            Task {
                id: id.clone(),
                title: title.to_string(),
                is_completed: false,
                created_at: now.trunc_subsecs(0),
                completed_at: None,
            },
        );
        Some(id)
    }

    pub fn delete_task(&mut self, day: NaiveDate, task_id: &str) -> bool {
        let Some(record) = self.days.get_mut(&day) else {
            return false;
        };
        let before = record.tasks.len();
        record.tasks.retain(|task| task.id != task_id);
        record.tasks.len() != before
    }

    pub fn set_task_completed(
        &mut self,
        day: NaiveDate,
        task_id: &str,
        completed: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(task) = self
            .days
            .get_mut(&day)
            .and_then(|record| record.tasks.iter_mut().find(|task| task.id == task_id))
        else {
            return false;
        };

        task.is_completed = completed;
        task.completed_at = completed.then(|| now.trunc_subsecs(0));
        true
    }

    pub fn memo(&self, day: NaiveDate) -> &str {
        self.day(day).map(|record| record.memo.as_str()).unwrap_or("")
    }

    pub fn set_memo(&mut self, day: NaiveDate, memo: &str) -> bool {
        if self.memo(day) == memo {
            return false;
        }
        self.days.entry(day).or_default().memo = memo.to_string();
        true
    }

    pub fn timer_presets(&self) -> TimerPresets {
        self.timer_presets
    }

    pub fn set_timer_preset(&mut self, index: usize, minutes: i64) -> Option<u32> {
        self.timer_presets.set(index, minutes)
    }

    pub fn background_image(&self) -> Option<&str> {
        self.background_image.as_deref()
    }

    pub(crate) fn set_background_image(&mut self, filename: Option<String>) -> bool {
        if self.background_image == filename {
            return false;
        }
        self.background_image = filename;
        true
    }

    pub fn selected_app_icon_id(&self) -> Option<&str> {
        self.selected_app_icon_id.as_deref()
    }

    pub fn set_selected_app_icon_id(&mut self, icon_id: Option<&str>) -> bool {
        let icon_id = icon_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if self.selected_app_icon_id == icon_id {
            return false;
        }
        self.selected_app_icon_id = icon_id;
        true
    }

    /// Drops tracked targets, days, presets and the background reference.
    /// The icon choice is an appearance setting and survives.
    pub fn reset_all(&mut self) {
        self.tracked_targets.clear();
        self.days.clear();
        self.timer_presets = TimerPresets::default();
        self.background_image = None;
    }
}

pub fn generate_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{DEFAULT_PRESET_MINUTES, Ledger, TimerPresets};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).expect("valid date")
    }

    #[test]
    fn tracked_targets_stay_sorted_by_name() {
        let mut ledger = Ledger::new();
        assert!(ledger.add_tracked_target("com.zed", "zed"));
        assert!(ledger.add_tracked_target("com.apple.Safari", "Safari"));
        assert!(ledger.add_tracked_target("com.arc", "arc"));
        assert!(!ledger.add_tracked_target("   ", "Nothing"));

        let names = ledger
            .tracked_targets()
            .iter()
            .map(|target| target.display_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["arc", "Safari", "zed"]);

        assert!(ledger.add_tracked_target("com.zed", "Alpha Zed"));
        assert_eq!(ledger.tracked_targets()[0].bundle_id, "com.zed");
        assert_eq!(ledger.tracked_targets().len(), 3);
    }

    #[test]
    fn removing_a_target_keeps_its_usage() {
        let mut ledger = Ledger::new();
        ledger.add_tracked_target("com.arc", "Arc");
        assert!(ledger.add_usage(day(), "com.arc", 30.0));
        assert!(ledger.remove_tracked_target("com.arc"));
        assert!(!ledger.remove_tracked_target("com.arc"));

        assert_eq!(ledger.app_seconds(day()).get("com.arc"), Some(&30.0));
        assert!(ledger.usage_report(day()).rows.is_empty());
    }

    #[test]
    fn usage_only_accumulates_positive_seconds() {
        let mut ledger = Ledger::new();
        assert!(ledger.add_usage(day(), "com.arc", 1.5));
        assert!(ledger.add_usage(day(), "com.arc", 2.5));
        assert!(!ledger.add_usage(day(), "com.arc", 0.0));
        assert!(!ledger.add_usage(day(), "com.arc", -3.0));
        assert!(!ledger.add_usage(day(), "com.arc", f64::NAN));

        assert_eq!(ledger.app_seconds(day()).get("com.arc"), Some(&4.0));
    }

    #[test]
    fn usage_report_orders_by_time_spent() {
        let mut ledger = Ledger::new();
        ledger.add_tracked_target("com.arc", "Arc");
        ledger.add_tracked_target("com.zed", "Zed");
        ledger.add_tracked_target("com.mail", "Mail");
        ledger.add_usage(day(), "com.zed", 120.0);
        ledger.add_usage(day(), "com.arc", 60.0);
        ledger.add_usage(day(), "com.orphan", 999.0);

        let report = ledger.usage_report(day());
        let ids = report
            .rows
            .iter()
            .map(|row| row.target.bundle_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["com.zed", "com.arc", "com.mail"]);
        assert_eq!(report.total_seconds, 180.0);
    }

    #[test]
    fn new_tasks_go_to_the_front() {
        let mut ledger = Ledger::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let first = ledger
            .add_task(day(), "  write report ", now)
            .expect("task should be created");
        let second = ledger
            .add_task(day(), "review", now)
            .expect("task should be created");
        assert!(ledger.add_task(day(), " \n\t", now).is_none());

        let tasks = ledger.tasks(day());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, second);
        assert_eq!(tasks[1].id, first);
        assert_eq!(tasks[1].title, "write report");
        assert_ne!(first, second);
    }

    #[test]
    fn completion_stamps_and_clears_completed_at() {
        let mut ledger = Ledger::new();
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let done_at = Utc.with_ymd_and_hms(2026, 1, 1, 11, 30, 0).unwrap();
        let id = ledger
            .add_task(day(), "ship", created)
            .expect("task should be created");

        assert!(ledger.set_task_completed(day(), &id, true, done_at));
        let task = &ledger.tasks(day())[0];
        assert!(task.is_completed);
        assert_eq!(task.completed_at, Some(done_at));
        assert_eq!(ledger.completed_tasks(day()).len(), 1);
        assert!(ledger.open_tasks(day()).is_empty());

        assert!(ledger.set_task_completed(day(), &id, false, done_at));
        let task = &ledger.tasks(day())[0];
        assert!(!task.is_completed);
        assert_eq!(task.completed_at, None);

        assert!(!ledger.set_task_completed(day(), "missing", true, done_at));
        assert!(!ledger.delete_task(day(), "missing"));
        assert!(ledger.delete_task(day(), &id));
        assert!(ledger.tasks(day()).is_empty());
    }

    #[test]
    fn memo_on_an_empty_day_is_not_materialized() {
        let mut ledger = Ledger::new();
        assert!(!ledger.set_memo(day(), ""));
        assert!(ledger.day(day()).is_none());

        assert!(ledger.set_memo(day(), "slow morning"));
        assert_eq!(ledger.memo(day()), "slow morning");
        assert!(!ledger.set_memo(day(), "slow morning"));
    }

    #[test]
    fn presets_are_clamped() {
        let mut presets = TimerPresets::default();
        assert_eq!(presets.as_array(), DEFAULT_PRESET_MINUTES);
        assert_eq!(presets.set(0, 0), Some(1));
        assert_eq!(presets.set(1, 5000), Some(1440));
        assert_eq!(presets.set(3, 10), None);
        assert_eq!(presets.duration_seconds(1), Some(1440 * 60));

        let stored = TimerPresets::from_stored(Some(&[-5, 45]));
        assert_eq!(stored.as_array(), [1, 45, 15]);
        assert_eq!(TimerPresets::from_stored(None), TimerPresets::default());
    }

    #[test]
    fn reset_all_keeps_icon_choice() {
        let mut ledger = Ledger::new();
        ledger.add_tracked_target("com.arc", "Arc");
        ledger.add_usage(day(), "com.arc", 10.0);
        ledger.set_timer_preset(2, 90);
        ledger.set_selected_app_icon_id(Some("sunset"));

        ledger.reset_all();
        assert!(ledger.tracked_targets().is_empty());
        assert!(ledger.days().is_empty());
        assert_eq!(ledger.timer_presets(), TimerPresets::default());
        assert_eq!(ledger.selected_app_icon_id(), Some("sunset"));
    }
}
