use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE_NAME, Config};
use crate::storage::StorageLayout;

pub const APP_DIR_NAME: &str = "andso";
pub const LEGACY_DIR_NAME: &str = "PTimer";

/// Environment lookups, injectable so resolution can be tested without
/// touching the process environment.
pub trait Env {
	fn var_os(&self, key: &str) -> Option<OsString>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl Env for ProcessEnv {
	fn var_os(&self, key: &str) -> Option<OsString> {
		env::var_os(key)
	}
}

impl<F> Env for F
where
	F: Fn(&str) -> Option<OsString>,
{
	fn var_os(&self, key: &str) -> Option<OsString> {
		self(key)
	}
}

pub fn config_path(env: &dyn Env, cli_path: Option<PathBuf>) -> PathBuf {
	if let Some(path) = cli_path {
		return absolutize(path);
	}

	if let Some(path) = non_empty(env, "ANDSO_CONFIG") {
		return absolutize(path);
	}

	config_dir(env).join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Data directory, highest precedence first: the command line, the config
/// file, `ANDSO_DATA_DIR`, then the platform data directory.
pub fn data_dir(env: &dyn Env, cli_path: Option<PathBuf>, config: &Config) -> PathBuf {
	if let Some(path) = cli_path {
		return absolutize(path);
	}

	if let Some(path) = config.data_dir.clone() {
		return absolutize(path);
	}

	if let Some(path) = non_empty(env, "ANDSO_DATA_DIR") {
		return absolutize(path);
	}

	platform_data_dir(env).join(APP_DIR_NAME)
}

pub fn legacy_dir_for(data_dir: &Path) -> PathBuf {
	match data_dir.parent() {
		Some(parent) => parent.join(LEGACY_DIR_NAME),
		None => PathBuf::from(LEGACY_DIR_NAME),
	}
}

pub fn storage_layout(env: &dyn Env, cli_path: Option<PathBuf>, config: &Config) -> StorageLayout {
	let dir = data_dir(env, cli_path, config);
	let legacy = match config.legacy_dir.clone() {
		Some(path) => absolutize(path),
		None => legacy_dir_for(&dir),
	};
	StorageLayout::new(dir).with_legacy_dir(legacy)
}

fn platform_data_dir(env: &dyn Env) -> PathBuf {
	#[cfg(target_os = "windows")]
	{
		if let Some(path) = non_empty(env, "APPDATA") {
			return path;
		}
	}

	if let Some(path) = non_empty(env, "XDG_DATA_HOME") {
		return path;
	}

	if let Some(path) = non_empty(env, "HOME") {
		return path.join(".local").join("share");
	}

	PathBuf::from(".")
}

fn config_dir(env: &dyn Env) -> PathBuf {
	#[cfg(target_os = "windows")]
	{
		if let Some(path) = non_empty(env, "APPDATA") {
			return path;
		}
	}

	if let Some(path) = non_empty(env, "XDG_CONFIG_HOME") {
		return path;
	}

	if let Some(path) = non_empty(env, "HOME") {
		return path.join(".config");
	}

	PathBuf::from(".")
}

fn non_empty(env: &dyn Env, key: &str) -> Option<PathBuf> {
	env.var_os(key)
		.filter(|value| !value.is_empty())
		.map(PathBuf::from)
}

pub fn absolutize(path: PathBuf) -> PathBuf {
	let path = if path.is_absolute() {
		path
	} else if let Ok(cwd) = env::current_dir() {
		cwd.join(path)
	} else {
		path
	};

	if path.exists() {
		fs::canonicalize(&path).unwrap_or(path)
	} else {
		path
	}
}
