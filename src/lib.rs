//! Foreground-time tracking companion: per-app usage split at local
//! midnight, three countdown timers, and a per-day task list and memo, all
//! kept in one JSON database.

pub mod calendar;
pub mod config;
pub mod domain;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod paths;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod timers;
pub mod tracker;
