//! The owning actor.
//!
//! One task owns the [`Store`], the [`SessionTracker`] and the
//! [`TimerBank`]. Event sources, the 1 Hz drivers and user edits all reach
//! that state through the actor's command channel, so mutations never
//! interleave. Writes are debounced on the store revision and handed by
//! value to a single writer task, which applies them in order.

use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};

use crate::domain::{Ledger, TimerPresets, UsageReport};
use crate::notify::Notifier;
use crate::storage::{DatabaseFile, StorageError};
use crate::store::{SnapshotSink, Store};
use crate::timers::{TimerBank, TimerExpired};
use crate::tracker::SessionTracker;

pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(750);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub save_debounce: Duration,
    pub heartbeat: Duration,
    pub timer_tick: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            save_debounce: DEFAULT_SAVE_DEBOUNCE,
            heartbeat: DEFAULT_HEARTBEAT,
            timer_tick: DEFAULT_TIMER_TICK,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("companion runtime has stopped")]
    Stopped,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct Companion {
    store: Store,
    tracker: SessionTracker,
    timers: TimerBank,
    clock: Arc<dyn Clock>,
}

impl Companion {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        let tracker = SessionTracker::new(store.calendar());
        let timers = TimerBank::new(&store.ledger().timer_presets());
        Self {
            store,
            tracker,
            timers,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.store.day_of(self.now())
    }

    pub fn ledger(&self) -> &Ledger {
        self.store.ledger()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn timers(&self) -> &TimerBank {
        &self.timers
    }

    pub fn usage_today(&self) -> UsageReport {
        self.store.usage_report(self.today())
    }

    pub fn target_activated(&mut self, target: Option<&str>) -> bool {
        let now = self.now();
        let tracker = &mut self.tracker;
        self.store
            .apply(|ledger| tracker.on_target_changed(ledger, target, now))
    }

    pub fn suspended(&mut self) -> bool {
        let now = self.now();
        let tracker = &mut self.tracker;
        self.store.apply(|ledger| tracker.on_suspend(ledger, now))
    }

    pub fn resumed(&mut self, active_target: Option<&str>) -> bool {
        let now = self.now();
        let tracker = &mut self.tracker;
        self.store
            .apply(|ledger| tracker.on_resume(ledger, active_target, now))
    }

    pub fn heartbeat(&mut self) -> bool {
        let now = self.now();
        let tracker = &mut self.tracker;
        self.store.apply(|ledger| tracker.on_heartbeat(ledger, now))
    }

    fn stop_tracking(&mut self) -> bool {
        let now = self.now();
        let tracker = &mut self.tracker;
        self.store.apply(|ledger| tracker.stop(ledger, now))
    }

    // The open session is credited before the tracked set changes so the
    // new status applies from this instant on.
    pub fn add_tracked_target(&mut self, bundle_id: &str, display_name: &str) -> bool {
        self.heartbeat();
        self.store.add_tracked_target(bundle_id, display_name)
    }

    pub fn remove_tracked_target(&mut self, bundle_id: &str) -> bool {
        self.heartbeat();
        self.store.remove_tracked_target(bundle_id)
    }

    pub fn add_task(&mut self, day: NaiveDate, title: &str) -> Option<String> {
        let now = self.now();
        self.store.add_task(day, title, now)
    }

    pub fn set_task_completed(&mut self, day: NaiveDate, task_id: &str, completed: bool) -> bool {
        let now = self.now();
        self.store.set_task_completed(day, task_id, completed, now)
    }

    pub fn delete_task(&mut self, day: NaiveDate, task_id: &str) -> bool {
        self.store.delete_task(day, task_id)
    }

    pub fn set_memo(&mut self, day: NaiveDate, memo: &str) -> bool {
        self.store.set_memo(day, memo)
    }

    pub fn set_selected_app_icon_id(&mut self, icon_id: Option<&str>) -> bool {
        self.store.set_selected_app_icon_id(icon_id)
    }

    pub fn set_timer_preset(&mut self, index: usize, minutes: i64) -> Option<u32> {
        let minutes = self.store.set_timer_preset(index, minutes)?;
        self.timers.set_duration(index, i64::from(minutes));
        Some(minutes)
    }

    pub fn toggle_timer(&mut self, index: usize) -> Option<bool> {
        let now = self.now();
        self.timers.toggle(index, now)
    }

    pub fn reset_timer(&mut self, index: usize) -> bool {
        self.timers.reset(index)
    }

    pub fn tick_timers(&mut self) -> Vec<TimerExpired> {
        let now = self.now();
        self.timers.tick(now)
    }

    pub fn set_background(&mut self, source: &std::path::Path) -> Result<String, StorageError> {
        self.store.set_background(source)
    }

    pub fn clear_background(&mut self) -> bool {
        self.store.clear_background()
    }

    pub fn export_to(&self, path: &std::path::Path) -> Result<(), StorageError> {
        self.store.export_to(path)
    }

    /// Prefer [`CompanionHandle::import_from`], which also writes the result.
    pub fn import_from(&mut self, path: &std::path::Path) -> Result<(), StorageError> {
        self.store.import_from(path)?;
        let presets = self.store.ledger().timer_presets();
        self.timers.apply_presets(&presets);
        Ok(())
    }

    pub fn reset_all(&mut self) {
        self.store.reset_all();
        self.timers.apply_presets(&TimerPresets::default());
    }
}

type Call = Box<dyn FnOnce(&mut Companion) + Send>;

enum Command {
    Call(Call),
    Flush(oneshot::Sender<Result<(), StorageError>>),
    Shutdown(oneshot::Sender<Result<(), StorageError>>),
}

#[derive(Clone)]
pub struct CompanionHandle {
    commands: mpsc::UnboundedSender<Command>,
    changes: watch::Receiver<u64>,
}

impl CompanionHandle {
    pub async fn call<R, F>(&self, f: F) -> Result<R, RuntimeError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Companion) -> R + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let call: Call = Box::new(move |companion| {
            let _ = reply.send(f(companion));
        });
        self.commands
            .send(Command::Call(call))
            .map_err(|_| RuntimeError::Stopped)?;
        response.await.map_err(|_| RuntimeError::Stopped)
    }

    pub async fn target_activated(&self, target: Option<String>) -> Result<(), RuntimeError> {
        self.call(move |companion| {
            companion.target_activated(target.as_deref());
        })
        .await
    }

    pub async fn suspended(&self) -> Result<(), RuntimeError> {
        self.call(|companion| {
            companion.suspended();
        })
        .await
    }

    pub async fn resumed(&self, active_target: Option<String>) -> Result<(), RuntimeError> {
        self.call(move |companion| {
            companion.resumed(active_target.as_deref());
        })
        .await
    }

    pub async fn flush(&self) -> Result<(), RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .map_err(|_| RuntimeError::Stopped)?;
        Ok(response.await.map_err(|_| RuntimeError::Stopped)??)
    }

    pub async fn import_from(&self, path: PathBuf) -> Result<(), RuntimeError> {
        self.call(move |companion| companion.import_from(&path))
            .await??;
        self.flush().await
    }

    pub async fn export_to(&self, path: PathBuf) -> Result<(), RuntimeError> {
        Ok(self
            .call(move |companion| companion.export_to(&path))
            .await??)
    }

    /// Closes the open session, writes everything and stops the actor.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(reply))
            .map_err(|_| RuntimeError::Stopped)?;
        Ok(response.await.map_err(|_| RuntimeError::Stopped)??)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }
}

pub fn spawn(
    store: Store,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    config: RuntimeConfig,
) -> (CompanionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let revision = store.revision();
    let (changes_tx, changes_rx) = watch::channel(revision);

    tokio::spawn(run_writer(store.sink(), jobs_rx));

    let actor = Actor {
        companion: Companion::new(store, clock),
        notifier,
        config,
        commands: commands_rx,
        changes: changes_tx,
        writer: jobs_tx,
        pending: None,
        seen_revision: revision,
    };
    let task = tokio::spawn(actor.run());

    let handle = CompanionHandle {
        commands: commands_tx,
        changes: changes_rx,
    };
    (handle, task)
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    deadline: Instant,
    revision: u64,
}

struct WriteJob {
    revision: u64,
    file: DatabaseFile,
    reply: Option<oneshot::Sender<Result<(), StorageError>>>,
}

struct Actor {
    companion: Companion,
    notifier: Arc<dyn Notifier>,
    config: RuntimeConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    changes: watch::Sender<u64>,
    writer: mpsc::UnboundedSender<WriteJob>,
    pending: Option<PendingWrite>,
    seen_revision: u64,
}

impl Actor {
    async fn run(mut self) {
        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat,
            self.config.heartbeat,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timer_driver: Option<Interval> = None;

        loop {
            self.sync_timer_driver(&mut timer_driver);
            let deadline = self.pending.map(|pending| pending.deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Call(call)) => call(&mut self.companion),
                    Some(Command::Flush(reply)) => {
                        let result = self.flush_now().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let result = self.shutdown().await;
                        let _ = reply.send(result);
                        return;
                    }
                    None => {
                        if let Err(err) = self.shutdown().await {
                            warn!(error = %err, "final write failed");
                        }
                        return;
                    }
                },
                _ = heartbeat.tick() => {
                    self.companion.heartbeat();
                }
                _ = next_tick(&mut timer_driver) => {
                    for expiry in self.companion.tick_timers() {
                        self.notifier.timer_expired(&expiry);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.write_pending();
                }
            }

            self.observe_revision();
        }
    }

    // The timer driver only exists while a slot is running.
    fn sync_timer_driver(&self, driver: &mut Option<Interval>) {
        let running = self.companion.timers().any_running();
        if running && driver.is_none() {
            let period = self.config.timer_tick;
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *driver = Some(interval);
        } else if !running && driver.is_some() {
            *driver = None;
        }
    }

    /// Re-arms the debounce whenever the revision moved, replacing any
    /// earlier pending write.
    fn observe_revision(&mut self) {
        let revision = self.companion.store.revision();
        if revision == self.seen_revision {
            return;
        }
        self.seen_revision = revision;
        self.pending = Some(PendingWrite {
            deadline: Instant::now() + self.config.save_debounce,
            revision,
        });
        self.changes.send_replace(revision);
    }

    fn write_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let (revision, file) = self.companion.store.snapshot();
        debug!(scheduled = pending.revision, revision, "debounced write");
        self.companion.store.mark_persisted(revision);
        if self
            .writer
            .send(WriteJob {
                revision,
                file,
                reply: None,
            })
            .is_err()
        {
            warn!(revision, "writer task is gone, write dropped");
        }
    }

    async fn flush_now(&mut self) -> Result<(), StorageError> {
        self.pending = None;
        let (revision, file) = self.companion.store.snapshot();
        let (reply, response) = oneshot::channel();
        self.writer
            .send(WriteJob {
                revision,
                file,
                reply: Some(reply),
            })
            .map_err(|_| writer_gone())?;
        let result = response.await.map_err(|_| writer_gone())?;
        result?;
        self.companion.store.mark_persisted(revision);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), StorageError> {
        self.companion.stop_tracking();
        self.observe_revision();
        let result = self.flush_now().await;
        info!(revision = self.companion.store.revision(), "companion stopped");
        result
    }
}

async fn next_tick(driver: &mut Option<Interval>) {
    match driver {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

fn writer_gone() -> StorageError {
    StorageError::Writer("writer task is gone".to_string())
}

/// Applies write jobs strictly in the order they were queued. A debounced
/// job whose revision was already written is skipped; failures of those
/// jobs are logged and dropped, the next mutation schedules a new one.
async fn run_writer(sink: Arc<dyn SnapshotSink>, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
    let mut written: Option<u64> = None;

    while let Some(job) = jobs.recv().await {
        let WriteJob {
            revision,
            file,
            reply,
        } = job;
        if reply.is_none() && written.is_some_and(|done| done >= revision) {
            continue;
        }

        let sink = Arc::clone(&sink);
        let result = match tokio::task::spawn_blocking(move || sink.write(&file)).await {
            Ok(result) => result,
            Err(err) => Err(StorageError::Writer(err.to_string())),
        };

        match &result {
            Ok(()) => {
                written = Some(revision);
                debug!(revision, "database written");
            }
            Err(err) if reply.is_none() => warn!(revision, error = %err, "database write failed"),
            Err(_) => {}
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}
