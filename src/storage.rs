use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{DayRecord, Ledger, TimerPresets, TrackedTarget};

pub const SCHEMA_VERSION: i64 = 1;
pub const DATABASE_FILE_NAME: &str = "database.json";

const BACKGROUND_STEM: &str = "background";
const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "heic", "heif", "tif", "tiff", "bmp", "webp",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse database file: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode database file: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unsupported database format (expected schema {expected}, got {actual})")]
    UnsupportedSchema { expected: i64, actual: i64 },
    #[error("failed to replace {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
    #[error("unsupported image file: {0}")]
    InvalidImage(String),
    #[error("database writer is unavailable: {0}")]
    Writer(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseFile {
    pub schema_version: i64,
    #[serde(default)]
    pub tracked_apps: Vec<TrackedTarget>,
    #[serde(default)]
    pub days: BTreeMap<NaiveDate, DayRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_presets_minutes: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_app_icon_id: Option<String>,
}

#[derive(Deserialize)]
struct SchemaHeader {
    #[serde(rename = "schemaVersion")]
    schema_version: i64,
}

impl DatabaseFile {
    pub fn from_ledger(ledger: &Ledger) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tracked_apps: ledger.tracked_targets.clone(),
            days: ledger.days.clone(),
            timer_presets_minutes: Some(
                ledger
                    .timer_presets
                    .as_array()
                    .iter()
                    .map(|minutes| i64::from(*minutes))
                    .collect(),
            ),
            background_image_filename: ledger.background_image.clone(),
            selected_app_icon_id: ledger.selected_app_icon_id.clone(),
        }
    }

    /// Rebuilds the ledger, re-validating the denormalized fields: presets
    /// are clamped and the background filename must name an existing file
    /// directly inside `asset_dir`.
    pub fn into_ledger(self, asset_dir: &Path) -> Ledger {
        Ledger {
            tracked_targets: self.tracked_apps,
            days: self.days,
            timer_presets: TimerPresets::from_stored(self.timer_presets_minutes.as_deref()),
            background_image: sanitize_background_filename(
                self.background_image_filename.as_deref(),
                asset_dir,
            ),
            selected_app_icon_id: self.selected_app_icon_id,
        }
    }
}

pub fn encode(file: &DatabaseFile) -> Result<String, StorageError> {
    // `Value` objects are ordered maps, which sorts struct fields too.
    let value = serde_json::to_value(file).map_err(StorageError::Encode)?;
    serde_json::to_string_pretty(&value).map_err(StorageError::Encode)
}

/// Parses a database file, rejecting any schema version other than ours
/// before looking at the rest of the document.
pub fn decode(raw: &str) -> Result<DatabaseFile, StorageError> {
    let header: SchemaHeader = serde_json::from_str(raw).map_err(StorageError::Decode)?;
    if header.schema_version != SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchema {
            expected: SCHEMA_VERSION,
            actual: header.schema_version,
        });
    }
    serde_json::from_str(raw).map_err(StorageError::Decode)
}

pub fn read_database(path: &Path) -> Result<DatabaseFile, StorageError> {
    let raw = fs::read_to_string(path).map_err(io_error(path))?;
    decode(&raw)
}

pub fn write_database(path: &Path, file: &DatabaseFile) -> Result<(), StorageError> {
    let content = encode(file)?;
    write_atomic(path, content.as_bytes())
}

/// Writes `contents` to a temporary file next to `path` and renames it over
/// `path`. Readers see either the previous file or the complete new one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let mut temp = Builder::new()
        .prefix(".database-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(io_error(dir))?;
    temp.write_all(contents).map_err(io_error(temp.path()))?;
    temp.as_file().sync_all().map_err(io_error(path))?;
    temp.persist(path).map_err(|source| StorageError::Persist {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    dir: PathBuf,
    legacy_dir: Option<PathBuf>,
}

impl StorageLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            legacy_dir: None,
        }
    }

    pub fn with_legacy_dir(mut self, legacy_dir: impl Into<PathBuf>) -> Self {
        self.legacy_dir = Some(legacy_dir.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.join(DATABASE_FILE_NAME)
    }

    pub fn legacy_database_path(&self) -> Option<PathBuf> {
        self.legacy_dir
            .as_ref()
            .map(|dir| dir.join(DATABASE_FILE_NAME))
    }

    pub fn asset_path(&self, filename: &str) -> Option<PathBuf> {
        sanitize_background_filename(Some(filename), &self.dir).map(|name| self.dir.join(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Canonical,
    Legacy,
    Defaults,
}

/// Startup load. Never fails: unreadable, corrupt or foreign-schema files
/// fall back to an empty ledger. A database found only in the legacy
/// directory is copied to the canonical location and left where it was.
pub fn load(layout: &StorageLayout) -> (Ledger, LoadOutcome) {
    if let Err(err) = fs::create_dir_all(layout.dir()) {
        warn!(path = %layout.dir().display(), error = %err, "failed to create storage directory");
    }

    let canonical = layout.database_path();
    let (path, outcome) = if canonical.exists() {
        (canonical.clone(), LoadOutcome::Canonical)
    } else {
        match layout.legacy_database_path().filter(|path| path.exists()) {
            Some(legacy) => (legacy, LoadOutcome::Legacy),
            None => {
                info!(path = %canonical.display(), "no database yet, starting fresh");
                return (Ledger::new(), LoadOutcome::Defaults);
            }
        }
    };

    let file = match read_database(&path) {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable database, starting fresh");
            return (Ledger::new(), LoadOutcome::Defaults);
        }
    };
    let ledger = file.into_ledger(layout.dir());

    if outcome == LoadOutcome::Legacy {
        match write_database(&canonical, &DatabaseFile::from_ledger(&ledger)) {
            Ok(()) => info!(from = %path.display(), to = %canonical.display(), "migrated legacy database"),
            Err(err) => warn!(error = %err, "failed to migrate legacy database"),
        }
    }

    (ledger, outcome)
}

/// Only `background.<image ext>` names ever refer to an asset, so a stored
/// reference can never point at the database or any other file.
pub fn is_background_asset_name(filename: &str) -> bool {
    let Some((stem, extension)) = filename.rsplit_once('.') else {
        return false;
    };
    stem == BACKGROUND_STEM && IMAGE_EXTENSIONS.contains(&extension)
}

pub fn sanitize_background_filename(filename: Option<&str>, asset_dir: &Path) -> Option<String> {
    let filename = filename.filter(|name| !name.is_empty())?;
    let last_component = Path::new(filename).file_name()?.to_str()?;
    if last_component != filename || !is_background_asset_name(filename) {
        return None;
    }
    if !asset_dir.join(filename).is_file() {
        return None;
    }
    Some(filename.to_string())
}

/// Copies `source` into the storage directory as `background.<ext>` via a
/// temporary file, then removes `previous` if it had another name.
pub fn install_background(
    layout: &StorageLayout,
    source: &Path,
    previous: Option<&str>,
) -> Result<String, StorageError> {
    let extension = source
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.trim().to_lowercase())
        .unwrap_or_default();
    if extension.is_empty() || !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return Err(StorageError::InvalidImage(source.display().to_string()));
    }

    let metadata = fs::metadata(source).map_err(io_error(source))?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(StorageError::InvalidImage(source.display().to_string()));
    }

    let dir = layout.dir();
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let destination_name = format!("{BACKGROUND_STEM}.{extension}");
    let destination = dir.join(&destination_name);
    let mut temp = Builder::new()
        .prefix("background-import-")
        .suffix(&format!(".{extension}"))
        .tempfile_in(dir)
        .map_err(io_error(dir))?;
    let mut reader = fs::File::open(source).map_err(io_error(source))?;
    io::copy(&mut reader, temp.as_file_mut()).map_err(io_error(source))?;
    temp.as_file().sync_all().map_err(io_error(&destination))?;
    temp.persist(&destination)
        .map_err(|source| StorageError::Persist {
            path: destination.clone(),
            source,
        })?;

    if let Some(previous) = previous.filter(|name| *name != destination_name) {
        remove_asset(layout, previous);
    }

    Ok(destination_name)
}

pub fn remove_asset(layout: &StorageLayout, filename: &str) {
    if !is_background_asset_name(filename) {
        warn!(filename, "refusing to remove a file that is not a background asset");
        return;
    }
    let Some(path) = layout.asset_path(filename) else {
        return;
    };
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove asset"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use chrono::{NaiveDate, TimeZone, Utc};
    use tempfile::{Builder, TempDir};

    use super::{
        DATABASE_FILE_NAME, DatabaseFile, LoadOutcome, SCHEMA_VERSION, StorageError, StorageLayout,
        decode, encode, install_background, is_background_asset_name, load, read_database,
        remove_asset, sanitize_background_filename, write_database,
    };
    use crate::domain::Ledger;

    fn sample_ledger() -> Ledger {
        let day = NaiveDate::from_ymd_opt(2026, 1, 1).expect("valid date");
        let mut ledger = Ledger::new();
        ledger.add_tracked_target("com.arc", "Arc");
        ledger.add_usage(day, "com.arc", 95.5);
        ledger.add_task(day, "write report", Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap());
        ledger.set_memo(day, "focus day");
        ledger.set_timer_preset(1, 25);
        ledger
    }

    fn temp_dir() -> TempDir {
        TempDir::new().expect("temp dir")
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = temp_dir();
        let path = dir.path().join("database.json");
        let ledger = sample_ledger();

        write_database(&path, &DatabaseFile::from_ledger(&ledger)).expect("write should succeed");
        let loaded = read_database(&path)
            .expect("read should succeed")
            .into_ledger(dir.path());

        assert_eq!(loaded, ledger);
    }

    #[test]
    fn encodes_sorted_keys() {
        let encoded = encode(&DatabaseFile::from_ledger(&sample_ledger())).expect("encode");
        let position = |key: &str| encoded.find(key).expect("key present");

        assert!(position("\"days\"") < position("\"schemaVersion\""));
        assert!(position("\"schemaVersion\"") < position("\"timerPresetsMinutes\""));
        assert!(position("\"timerPresetsMinutes\"") < position("\"trackedApps\""));
        assert!(position("\"appSeconds\"") < position("\"memo\""));
        assert!(position("\"memo\"") < position("\"tasks\""));
        assert!(encoded.contains("\"2026-01-01\""));
        assert!(encoded.contains("\"createdAt\": \"2026-01-01T09:00:00Z\""));
        assert!(!encoded.contains("completedAt"));
    }

    #[test]
    fn reads_files_written_by_the_desktop_app() {
        let raw = r#"{
  "days" : {
    "2025-03-01" : {
      "appSeconds" : { "com.apple.Safari" : 12.5 },
      "memo" : "",
      "tasks" : [
        {
          "completedAt" : "2025-03-01T10:00:00Z",
          "createdAt" : "2025-03-01T09:00:00Z",
          "id" : "6F9619FF-8B86-D011-B42D-00C04FC964FF",
          "isCompleted" : true,
          "title" : "plan"
        }
      ]
    }
  },
  "schemaVersion" : 1,
  "trackedApps" : [ { "bundleId" : "com.apple.Safari", "displayName" : "Safari" } ]
}"#;

        let dir = temp_dir();
        let ledger = decode(raw).expect("decode").into_ledger(dir.path());
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).expect("valid date");

        assert!(ledger.is_tracked("com.apple.Safari"));
        assert_eq!(ledger.app_seconds(day).get("com.apple.Safari"), Some(&12.5));
        assert_eq!(ledger.completed_tasks(day).len(), 1);
        assert_eq!(ledger.timer_presets().as_array(), [60, 30, 15]);
    }

    #[test]
    fn rejects_other_schema_versions() {
        let raw = format!("{{\"schemaVersion\": {}, \"days\": 3}}", SCHEMA_VERSION + 1);
        match decode(&raw) {
            Err(StorageError::UnsupportedSchema { expected, actual }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(actual, SCHEMA_VERSION + 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(decode("not json"), Err(StorageError::Decode(_))));
    }

    #[test]
    fn migrates_from_legacy_directory() {
        let root = temp_dir();
        let legacy_dir = root.path().join("PTimer");
        let layout = StorageLayout::new(root.path().join("andso")).with_legacy_dir(&legacy_dir);
        let legacy_path = legacy_dir.join("database.json");
        write_database(&legacy_path, &DatabaseFile::from_ledger(&sample_ledger()))
            .expect("write legacy");
        let legacy_before = fs::read_to_string(&legacy_path).expect("legacy contents");

        let (ledger, outcome) = load(&layout);
        assert_eq!(outcome, LoadOutcome::Legacy);
        assert_eq!(ledger, sample_ledger_without_randomness(&ledger));
        assert!(layout.database_path().exists());
        assert_eq!(fs::read_to_string(&legacy_path).expect("legacy contents"), legacy_before);

        let (reloaded, outcome) = load(&layout);
        assert_eq!(outcome, LoadOutcome::Canonical);
        assert_eq!(reloaded, ledger);
    }

    // Task ids are random, so compare against the loaded copy's ids.
    fn sample_ledger_without_randomness(loaded: &Ledger) -> Ledger {
        let mut expected = sample_ledger();
        for (day, record) in expected.days.iter_mut() {
            for (task, stored) in record.tasks.iter_mut().zip(loaded.tasks(*day)) {
                task.id = stored.id.clone();
            }
        }
        expected
    }

    #[test]
    fn falls_back_to_defaults() {
        let root = temp_dir();
        let layout = StorageLayout::new(root.path().join("andso"));

        let (ledger, outcome) = load(&layout);
        assert_eq!(outcome, LoadOutcome::Defaults);
        assert_eq!(ledger, Ledger::new());
        assert!(layout.dir().is_dir());

        fs::write(layout.database_path(), "{\"schemaVersion\": 99}").expect("write");
        assert_eq!(load(&layout).1, LoadOutcome::Defaults);

        fs::write(layout.database_path(), "{\"schemaVersion\": 1, \"days\": [").expect("write");
        assert_eq!(load(&layout), (Ledger::new(), LoadOutcome::Defaults));
    }

    #[test]
    fn interrupted_write_keeps_the_committed_file() {
        let root = temp_dir();
        let layout = StorageLayout::new(root.path());
        let ledger = sample_ledger();
        write_database(&layout.database_path(), &DatabaseFile::from_ledger(&ledger))
            .expect("write should succeed");

        // A crash between the temp write and the rename leaves a stray
        // partial temp file behind.
        let mut partial = Builder::new()
            .prefix(".database-")
            .suffix(".tmp")
            .tempfile_in(root.path())
            .expect("temp file");
        partial.write_all(b"{\"schemaVersion\": 1, \"da").expect("partial write");
        let (_file, _path) = partial.keep().expect("keep temp file");

        let (loaded, outcome) = load(&layout);
        assert_eq!(outcome, LoadOutcome::Canonical);
        assert_eq!(loaded, ledger);
    }

    #[test]
    fn background_filename_must_stay_inside_the_directory() {
        let root = temp_dir();
        fs::write(root.path().join("background.png"), b"png").expect("write asset");

        assert_eq!(
            sanitize_background_filename(Some("background.png"), root.path()),
            Some("background.png".to_string())
        );
        assert_eq!(sanitize_background_filename(Some("../background.png"), root.path()), None);
        assert_eq!(sanitize_background_filename(Some("/etc/passwd"), root.path()), None);
        assert_eq!(sanitize_background_filename(Some("missing.png"), root.path()), None);
        assert_eq!(sanitize_background_filename(Some(""), root.path()), None);
    }

    #[test]
    fn only_background_images_count_as_assets() {
        let root = temp_dir();
        let layout = StorageLayout::new(root.path());
        write_database(&layout.database_path(), &DatabaseFile::from_ledger(&Ledger::new()))
            .expect("write database");
        fs::write(root.path().join("notes.png"), b"png").expect("write");
        fs::write(root.path().join("background.txt"), b"text").expect("write");

        for name in [DATABASE_FILE_NAME, "notes.png", "background.txt", "background"] {
            assert_eq!(sanitize_background_filename(Some(name), root.path()), None, "{name}");
            remove_asset(&layout, name);
        }

        assert!(layout.database_path().is_file());
        assert!(root.path().join("notes.png").is_file());
        assert!(root.path().join("background.txt").is_file());
        assert!(is_background_asset_name("background.webp"));
    }

    #[test]
    fn installs_background_and_drops_the_previous_one() {
        let root = temp_dir();
        let layout = StorageLayout::new(root.path().join("andso"));
        let picked = root.path().join("Sunset.PNG");
        fs::write(&picked, b"not really a png").expect("write source");

        let name = install_background(&layout, &picked, None).expect("install png");
        assert_eq!(name, "background.png");
        assert_eq!(
            fs::read(layout.dir().join("background.png")).expect("installed"),
            b"not really a png"
        );

        let jpeg = root.path().join("beach.jpeg");
        fs::write(&jpeg, b"jpeg bytes").expect("write source");
        let name = install_background(&layout, &jpeg, Some("background.png")).expect("install jpeg");
        assert_eq!(name, "background.jpeg");
        assert!(!layout.dir().join("background.png").exists());
        assert!(picked.exists());
    }

    #[test]
    fn rejects_non_images() {
        let root = temp_dir();
        let layout = StorageLayout::new(root.path());
        let notes = root.path().join("notes.txt");
        fs::write(&notes, b"text").expect("write");
        let empty = root.path().join("empty.png");
        fs::write(&empty, b"").expect("write");

        assert!(matches!(
            install_background(&layout, &notes, None),
            Err(StorageError::InvalidImage(_))
        ));
        assert!(matches!(
            install_background(&layout, &empty, None),
            Err(StorageError::InvalidImage(_))
        ));
        assert!(matches!(
            install_background(&layout, &root.path().join("gone.png"), None),
            Err(StorageError::Io { .. })
        ));
    }
}
