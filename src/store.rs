use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

use crate::calendar::DayCalendar;
use crate::domain::{Ledger, UsageReport};
use crate::storage::{
    self, DatabaseFile, LoadOutcome, StorageError, StorageLayout, install_background,
    read_database, remove_asset, write_database,
};

pub trait SnapshotSink: Send + Sync {
    fn write(&self, file: &DatabaseFile) -> Result<(), StorageError>;
}

impl SnapshotSink for StorageLayout {
    fn write(&self, file: &DatabaseFile) -> Result<(), StorageError> {
        write_database(&self.database_path(), file)
    }
}

/// Sole owner of the ledger.
///
/// Every change bumps `revision`; whoever drives the store compares
/// revisions to decide when a write is due.
pub struct Store {
    ledger: Ledger,
    layout: StorageLayout,
    calendar: Arc<dyn DayCalendar>,
    sink: Arc<dyn SnapshotSink>,
    load_outcome: LoadOutcome,
    revision: u64,
    persisted_revision: u64,
}

impl Store {
    /// Loads the ledger from `layout`, migrating from the legacy directory
    /// when needed, and writes back to the same layout.
    pub fn open(layout: StorageLayout, calendar: Arc<dyn DayCalendar>) -> Self {
        let (ledger, load_outcome) = storage::load(&layout);
        info!(outcome = ?load_outcome, path = %layout.database_path().display(), "database loaded");
        let sink: Arc<dyn SnapshotSink> = Arc::new(layout.clone());
        Self {
            ledger,
            layout,
            calendar,
            sink,
            load_outcome,
            revision: 0,
            persisted_revision: 0,
        }
    }

    pub fn with_sink(
        ledger: Ledger,
        layout: StorageLayout,
        calendar: Arc<dyn DayCalendar>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        Self {
            ledger,
            layout,
            calendar,
            sink,
            load_outcome: LoadOutcome::Defaults,
            revision: 0,
            persisted_revision: 0,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn calendar(&self) -> Arc<dyn DayCalendar> {
        Arc::clone(&self.calendar)
    }

    pub fn sink(&self) -> Arc<dyn SnapshotSink> {
        Arc::clone(&self.sink)
    }

    pub fn load_outcome(&self) -> LoadOutcome {
        self.load_outcome
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_dirty(&self) -> bool {
        self.revision != self.persisted_revision
    }

    pub fn day_of(&self, now: DateTime<Utc>) -> NaiveDate {
        self.calendar.local_day(now)
    }

    pub fn usage_report(&self, day: NaiveDate) -> UsageReport {
        self.ledger.usage_report(day)
    }

    pub fn apply(&mut self, mutate: impl FnOnce(&mut Ledger) -> bool) -> bool {
        let changed = mutate(&mut self.ledger);
        if changed {
            self.touch();
        }
        changed
    }

    pub fn add_tracked_target(&mut self, bundle_id: &str, display_name: &str) -> bool {
        self.apply(|ledger| ledger.add_tracked_target(bundle_id, display_name))
    }

    pub fn remove_tracked_target(&mut self, bundle_id: &str) -> bool {
        self.apply(|ledger| ledger.remove_tracked_target(bundle_id))
    }

    pub fn add_task(&mut self, day: NaiveDate, title: &str, now: DateTime<Utc>) -> Option<String> {
        let id = self.ledger.add_task(day, title, now)?;
        self.touch();
        Some(id)
    }

    pub fn set_task_completed(
        &mut self,
        day: NaiveDate,
        task_id: &str,
        completed: bool,
        now: DateTime<Utc>,
    ) -> bool {
        self.apply(|ledger| ledger.set_task_completed(day, task_id, completed, now))
    }

    pub fn delete_task(&mut self, day: NaiveDate, task_id: &str) -> bool {
        self.apply(|ledger| ledger.delete_task(day, task_id))
    }

    pub fn set_memo(&mut self, day: NaiveDate, memo: &str) -> bool {
        self.apply(|ledger| ledger.set_memo(day, memo))
    }

    pub fn set_timer_preset(&mut self, index: usize, minutes: i64) -> Option<u32> {
        let minutes = self.ledger.set_timer_preset(index, minutes)?;
        self.touch();
        Some(minutes)
    }

    pub fn set_selected_app_icon_id(&mut self, icon_id: Option<&str>) -> bool {
        self.apply(|ledger| ledger.set_selected_app_icon_id(icon_id))
    }

    pub fn background_path(&self) -> Option<std::path::PathBuf> {
        self.ledger
            .background_image()
            .and_then(|name| self.layout.asset_path(name))
    }

    pub fn set_background(&mut self, source: &Path) -> Result<String, StorageError> {
        let name = install_background(&self.layout, source, self.ledger.background_image())?;
        self.ledger.set_background_image(Some(name.clone()));
        // The file itself changed even if the name did not.
        self.touch();
        Ok(name)
    }

    pub fn clear_background(&mut self) -> bool {
        if let Some(name) = self.ledger.background_image() {
            remove_asset(&self.layout, name);
        }
        self.apply(|ledger| ledger.set_background_image(None))
    }

    pub fn reset_all(&mut self) {
        if let Some(name) = self.ledger.background_image() {
            remove_asset(&self.layout, name);
        }
        self.ledger.reset_all();
        self.touch();
    }

    pub fn snapshot(&self) -> (u64, DatabaseFile) {
        (self.revision, DatabaseFile::from_ledger(&self.ledger))
    }

    pub fn mark_persisted(&mut self, revision: u64) {
        self.persisted_revision = self.persisted_revision.max(revision);
    }

    pub fn save_now(&mut self) -> Result<(), StorageError> {
        let (revision, file) = self.snapshot();
        self.sink.write(&file)?;
        self.mark_persisted(revision);
        Ok(())
    }

    pub fn export_to(&self, path: &Path) -> Result<(), StorageError> {
        write_database(path, &DatabaseFile::from_ledger(&self.ledger))
    }

    /// Replaces the whole ledger with the file at `path`. A file with another
    /// schema version is rejected and leaves the ledger untouched. The caller
    /// is expected to persist immediately afterwards.
    pub fn import_from(&mut self, path: &Path) -> Result<(), StorageError> {
        let ledger = read_database(path)?.into_ledger(self.layout.dir());
        self.ledger = ledger;
        self.touch();
        info!(path = %path.display(), "database imported");
        Ok(())
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}
