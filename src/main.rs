use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use andso::calendar::{DayCalendar, format_duration, parse_day_key};
use andso::config::Config;
use andso::domain::{TIMER_SLOTS, UsageReport};
use andso::lock::{self, RunLock};
use andso::logging;
use andso::notify::LogNotifier;
use andso::paths::{self, ProcessEnv};
use andso::runtime::{self, CompanionHandle, RuntimeConfig, RuntimeError, SystemClock};
use andso::storage::StorageLayout;
use andso::store::Store;
use chrono::{Local, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "andso", about = "Foreground-time tracking companion")]
struct Cli {
	#[arg(long, global = true)]
	data_dir: Option<PathBuf>,
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Start the companion and read activation events from stdin.
	Run,
	Usage {
		#[arg(long)]
		day: Option<String>,
	},
	Apps {
		#[command(subcommand)]
		action: AppsAction,
	},
	Task {
		#[arg(long, global = true)]
		day: Option<String>,
		#[command(subcommand)]
		action: TaskAction,
	},
	Memo {
		#[arg(long, global = true)]
		day: Option<String>,
		#[command(subcommand)]
		action: MemoAction,
	},
	Preset {
		#[command(subcommand)]
		action: PresetAction,
	},
	Export {
		path: PathBuf,
	},
	Import {
		path: PathBuf,
	},
	ResetAll,
	Background {
		#[command(subcommand)]
		action: BackgroundAction,
	},
	Icon {
		#[command(subcommand)]
		action: IconAction,
	},
	/// Print the database path.
	Where,
}

#[derive(Debug, Subcommand)]
enum AppsAction {
	List,
	Add {
		#[arg(long)]
		id: String,
		#[arg(long)]
		name: Option<String>,
	},
	Remove {
		#[arg(long)]
		id: String,
	},
}

#[derive(Debug, Subcommand)]
enum TaskAction {
	List,
	Add {
		#[arg(long)]
		title: String,
	},
	Done {
		#[arg(long)]
		id: String,
	},
	Undo {
		#[arg(long)]
		id: String,
	},
	Delete {
		#[arg(long)]
		id: String,
	},
}

#[derive(Debug, Subcommand)]
enum MemoAction {
	Show,
	Set {
		#[arg(long)]
		text: String,
	},
}

#[derive(Debug, Subcommand)]
enum PresetAction {
	Show,
	Set {
		#[arg(long)]
		slot: usize,
		#[arg(long, allow_negative_numbers = true)]
		minutes: i64,
	},
}

#[derive(Debug, Subcommand)]
enum BackgroundAction {
	Show,
	Set { path: PathBuf },
	Clear,
}

#[derive(Debug, Subcommand)]
enum IconAction {
	Show,
	Set {
		#[arg(long)]
		id: Option<String>,
	},
}

fn main() {
	if let Err(err) = run() {
		eprintln!("error: {err}");
		std::process::exit(1);
	}
}

fn run() -> Result<(), Box<dyn Error>> {
	let cli = Cli::parse();
	let env = ProcessEnv;

	let config = Config::load(&paths::config_path(&env, cli.config))?;
	logging::init(&config.log);

	let layout = paths::storage_layout(&env, cli.data_dir, &config);
	let calendar: Arc<dyn DayCalendar> = Arc::new(Local);

	match cli.command.unwrap_or(Command::Run) {
		Command::Run => run_companion(layout, calendar, config.runtime())?,
		Command::Where => println!("{}", layout.database_path().display()),
		command => execute_once(layout, calendar, command)?,
	}

	Ok(())
}

impl Command {
	// Anything that writes the database, or reads it to hand it elsewhere,
	// must not race a running companion.
	fn needs_exclusive_access(&self) -> bool {
		match self {
			Command::Run | Command::Where | Command::Usage { .. } => false,
			Command::Apps { action } => !matches!(action, AppsAction::List),
			Command::Task { action, .. } => !matches!(action, TaskAction::List),
			Command::Memo { action, .. } => !matches!(action, MemoAction::Show),
			Command::Preset { action } => !matches!(action, PresetAction::Show),
			Command::Background { action } => !matches!(action, BackgroundAction::Show),
			Command::Icon { action } => !matches!(action, IconAction::Show),
			Command::Export { .. } | Command::Import { .. } | Command::ResetAll => true,
		}
	}
}

fn execute_once(
	layout: StorageLayout,
	calendar: Arc<dyn DayCalendar>,
	command: Command,
) -> Result<(), Box<dyn Error>> {
	if command.needs_exclusive_access() {
		lock::ensure_unlocked(layout.dir())?;
	}

	let mut store = Store::open(layout, calendar);
	execute(&mut store, command)?;
	if store.is_dirty() {
		store.save_now()?;
	}
	Ok(())
}

fn execute(store: &mut Store, command: Command) -> Result<(), Box<dyn Error>> {
	match command {
		Command::Usage { day } => {
			let day = parse_day(store, day.as_deref())?;
			println!("{}", format_usage(&store.usage_report(day)));
		}
		Command::Apps { action } => match action {
			AppsAction::List => {
				let targets = store.ledger().tracked_targets();
				if targets.is_empty() {
					println!("no tracked apps");
				}
				for target in targets {
					println!("{} | {}", target.bundle_id, target.display_name);
				}
			}
			AppsAction::Add { id, name } => {
				if !store.add_tracked_target(&id, name.as_deref().unwrap_or("")) {
					return Err("app id must not be empty".into());
				}
				println!("tracking {}", id.trim());
			}
			AppsAction::Remove { id } => {
				if !store.remove_tracked_target(&id) {
					return Err(format!("{id} is not tracked").into());
				}
				println!("stopped tracking {id}");
			}
		},
		Command::Task { day, action } => {
			let day = parse_day(store, day.as_deref())?;
			match action {
				TaskAction::List => print_tasks(store, day),
				TaskAction::Add { title } => {
					let task_id = store
						.add_task(day, &title, Utc::now())
						.ok_or("task title must not be empty")?;
					println!("created task {task_id}");
				}
				TaskAction::Done { id } => {
					require_task(store.set_task_completed(day, &id, true, Utc::now()), &id, day)?;
					println!("completed {id}");
				}
				TaskAction::Undo { id } => {
					require_task(store.set_task_completed(day, &id, false, Utc::now()), &id, day)?;
					println!("reopened {id}");
				}
				TaskAction::Delete { id } => {
					require_task(store.delete_task(day, &id), &id, day)?;
					println!("deleted {id}");
				}
			}
		}
		Command::Memo { day, action } => {
			let day = parse_day(store, day.as_deref())?;
			match action {
				MemoAction::Show => println!("{}", store.ledger().memo(day)),
				MemoAction::Set { text } => {
					store.set_memo(day, &text);
					println!("memo saved for {}", day.format("%Y-%m-%d"));
				}
			}
		}
		Command::Preset { action } => match action {
			PresetAction::Show => {
				let presets = store.ledger().timer_presets().as_array();
				for (index, minutes) in presets.iter().enumerate() {
					println!("slot {}: {minutes} min", index + 1);
				}
			}
			PresetAction::Set { slot, minutes } => {
				let minutes = slot
					.checked_sub(1)
					.and_then(|index| store.set_timer_preset(index, minutes))
					.ok_or_else(|| format!("slot must be between 1 and {TIMER_SLOTS}"))?;
				println!("slot {slot}: {minutes} min");
			}
		},
		Command::Export { path } => {
			store.export_to(&path)?;
			println!("exported to {}", path.display());
		}
		Command::Import { path } => {
			store.import_from(&path)?;
			println!("imported {}", path.display());
		}
		Command::ResetAll => {
			store.reset_all();
			println!("all data cleared");
		}
		Command::Background { action } => match action {
			BackgroundAction::Show => match store.background_path() {
				Some(path) => println!("{}", path.display()),
				None => println!("no background image"),
			},
			BackgroundAction::Set { path } => {
				let filename = store.set_background(&path)?;
				println!("background stored as {filename}");
			}
			BackgroundAction::Clear => {
				if store.clear_background() {
					println!("background cleared");
				} else {
					println!("no background image");
				}
			}
		},
		Command::Icon { action } => match action {
			IconAction::Show => {
				println!("{}", store.ledger().selected_app_icon_id().unwrap_or("default"));
			}
			IconAction::Set { id } => {
				store.set_selected_app_icon_id(id.as_deref());
				println!("{}", store.ledger().selected_app_icon_id().unwrap_or("default"));
			}
		},
		Command::Run | Command::Where => {}
	}

	Ok(())
}

fn run_companion(
	layout: StorageLayout,
	calendar: Arc<dyn DayCalendar>,
	config: RuntimeConfig,
) -> Result<(), Box<dyn Error>> {
	let _lock = RunLock::acquire(layout.dir())?;
	let executor = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;

	let result = executor.block_on(async move {
		let store = Store::open(layout, calendar);
		let (handle, task) = runtime::spawn(
			store,
			Arc::new(SystemClock),
			Arc::new(LogNotifier),
			config,
		);
		info!("companion running, reading events from stdin");

		drive(&handle, BufReader::new(tokio::io::stdin()), termination()).await?;

		handle.shutdown().await?;
		task.await?;
		Ok::<(), Box<dyn Error>>(())
	});

	// A pending stdin read would otherwise hold the runtime open.
	executor.shutdown_background();
	result
}

/// Applies input lines until `quit`, end of input, or `stop` completes.
async fn drive<R, S>(handle: &CompanionHandle, input: R, stop: S) -> io::Result<()>
where
	R: AsyncBufRead + Unpin,
	S: Future<Output = ()>,
{
	let mut lines = input.lines();
	tokio::pin!(stop);

	loop {
		tokio::select! {
			line = lines.next_line() => {
				let Some(line) = line? else {
					return Ok(());
				};
				match parse_event_line(&line) {
					Ok(Some(EventLine::Quit)) => return Ok(()),
					Ok(Some(event)) => match dispatch(handle, event).await {
						Ok(Some(reply)) => println!("{reply}"),
						Ok(None) => {}
						Err(RuntimeError::Stopped) => {
							eprintln!("error: {}", RuntimeError::Stopped);
							return Ok(());
						}
						Err(err) => eprintln!("error: {err}"),
					},
					Ok(None) => {}
					Err(err) => eprintln!("error: {err}"),
				}
			}
			_ = &mut stop => return Ok(()),
		}
	}
}

/// Completes on Ctrl-C, or on SIGTERM where signals exist.
async fn termination() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = terminate.recv() => {}
				}
				return;
			}
			Err(err) => warn!(error = %err, "cannot listen for SIGTERM"),
		}
	}

	if let Err(err) = tokio::signal::ctrl_c().await {
		warn!(error = %err, "cannot listen for Ctrl-C");
		std::future::pending::<()>().await;
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventLine {
	Activate(Option<String>),
	Suspend,
	Resume(Option<String>),
	TimerToggle(usize),
	TimerReset(usize),
	AddApp { id: String, name: String },
	RemoveApp(String),
	AddTask(String),
	SetTaskCompleted { id: String, completed: bool },
	DeleteTask(String),
	SetMemo(String),
	SetPreset { slot: usize, minutes: i64 },
	SetIcon(Option<String>),
	SetBackground(PathBuf),
	ClearBackground,
	Export(PathBuf),
	Import(PathBuf),
	ResetAll,
	Usage,
	Flush,
	Quit,
}

/// One event per line. `-` stands for "no foreground target"; titles, memo
/// text, app names and paths run to the end of the line. Task and memo
/// edits apply to the current local day.
fn parse_event_line(line: &str) -> Result<Option<EventLine>, String> {
	let line = line.trim();
	if line.is_empty() || line.starts_with('#') {
		return Ok(None);
	}

	let unrecognised = || format!("unrecognised event: {line}");
	let (verb, rest) = split_word(line);
	let (action, tail) = split_word(rest);

	let event = match (verb, action) {
		("activate", target) if !target.is_empty() && tail.is_empty() => {
			EventLine::Activate(parse_target(target))
		}
		("suspend", "") => EventLine::Suspend,
		("resume", "") => EventLine::Resume(None),
		("resume", target) if tail.is_empty() => EventLine::Resume(parse_target(target)),
		("timer", "toggle") => {
			EventLine::TimerToggle(parse_slot(one_word(tail).ok_or_else(unrecognised)?)?)
		}
		("timer", "reset") => {
			EventLine::TimerReset(parse_slot(one_word(tail).ok_or_else(unrecognised)?)?)
		}
		("apps", "add") => {
			let (id, name) = split_word(tail);
			if id.is_empty() {
				return Err(unrecognised());
			}
			EventLine::AddApp {
				id: id.to_string(),
				name: name.to_string(),
			}
		}
		("apps", "remove") => {
			EventLine::RemoveApp(one_word(tail).ok_or_else(unrecognised)?.to_string())
		}
		("task", "add") if !tail.is_empty() => EventLine::AddTask(tail.to_string()),
		("task", "done") => EventLine::SetTaskCompleted {
			id: one_word(tail).ok_or_else(unrecognised)?.to_string(),
			completed: true,
		},
		("task", "undo") => EventLine::SetTaskCompleted {
			id: one_word(tail).ok_or_else(unrecognised)?.to_string(),
			completed: false,
		},
		("task", "delete") => {
			EventLine::DeleteTask(one_word(tail).ok_or_else(unrecognised)?.to_string())
		}
		("memo", "set") => EventLine::SetMemo(tail.to_string()),
		("preset", "set") => {
			let (slot, minutes) = split_word(tail);
			let minutes = one_word(minutes)
				.and_then(|minutes| minutes.parse::<i64>().ok())
				.ok_or_else(|| format!("preset minutes must be a whole number: {line}"))?;
			EventLine::SetPreset {
				slot: parse_slot(slot)?,
				minutes,
			}
		}
		("icon", "set") if tail.is_empty() => EventLine::SetIcon(None),
		("icon", "set") => {
			EventLine::SetIcon(Some(one_word(tail).ok_or_else(unrecognised)?.to_string()))
		}
		("background", "set") if !tail.is_empty() => EventLine::SetBackground(PathBuf::from(tail)),
		("background", "clear") if tail.is_empty() => EventLine::ClearBackground,
		("export", path) if !path.is_empty() => EventLine::Export(PathBuf::from(rest)),
		("import", path) if !path.is_empty() => EventLine::Import(PathBuf::from(rest)),
		("reset-all", "") => EventLine::ResetAll,
		("usage", "") => EventLine::Usage,
		("flush", "") => EventLine::Flush,
		("quit", "") => EventLine::Quit,
		_ => return Err(unrecognised()),
	};
	Ok(Some(event))
}

fn split_word(input: &str) -> (&str, &str) {
	let input = input.trim();
	match input.split_once(char::is_whitespace) {
		Some((word, rest)) => (word, rest.trim_start()),
		None => (input, ""),
	}
}

fn one_word(input: &str) -> Option<&str> {
	let (word, rest) = split_word(input);
	(!word.is_empty() && rest.is_empty()).then_some(word)
}

fn parse_target(raw: &str) -> Option<String> {
	(raw != "-").then(|| raw.to_string())
}

fn parse_slot(raw: &str) -> Result<usize, String> {
	raw.parse::<usize>()
		.ok()
		.filter(|slot| (1..=TIMER_SLOTS).contains(slot))
		.map(|slot| slot - 1)
		.ok_or_else(|| format!("timer slot must be between 1 and {TIMER_SLOTS}, got {raw}"))
}

async fn dispatch(handle: &CompanionHandle, event: EventLine) -> Result<Option<String>, RuntimeError> {
	let reply = match event {
		EventLine::Activate(target) => {
			handle.target_activated(target).await?;
			return Ok(None);
		}
		EventLine::Suspend => {
			handle.suspended().await?;
			return Ok(None);
		}
		EventLine::Resume(target) => {
			handle.resumed(target).await?;
			return Ok(None);
		}
		EventLine::TimerToggle(slot) => {
			match handle.call(move |companion| companion.toggle_timer(slot)).await? {
				Some(true) => format!("timer {} running", slot + 1),
				Some(false) => format!("timer {} paused", slot + 1),
				None => return Ok(None),
			}
		}
		EventLine::TimerReset(slot) => {
			handle.call(move |companion| companion.reset_timer(slot)).await?;
			format!("timer {} reset", slot + 1)
		}
		EventLine::AddApp { id, name } => {
			let target_id = id.clone();
			let added = handle
				.call(move |companion| companion.add_tracked_target(&target_id, &name))
				.await?;
			if added {
				format!("tracking {id}")
			} else {
				"app id must not be empty".to_string()
			}
		}
		EventLine::RemoveApp(id) => {
			let target_id = id.clone();
			let removed = handle
				.call(move |companion| companion.remove_tracked_target(&target_id))
				.await?;
			if removed {
				format!("stopped tracking {id}")
			} else {
				format!("{id} is not tracked")
			}
		}
		EventLine::AddTask(title) => {
			let task_id = handle
				.call(move |companion| {
					let today = companion.today();
					companion.add_task(today, &title)
				})
				.await?;
			match task_id {
				Some(task_id) => format!("created task {task_id}"),
				None => "task title must not be empty".to_string(),
			}
		}
		EventLine::SetTaskCompleted { id, completed } => {
			let task_id = id.clone();
			let found = handle
				.call(move |companion| {
					let today = companion.today();
					companion.set_task_completed(today, &task_id, completed)
				})
				.await?;
			match (found, completed) {
				(true, true) => format!("completed {id}"),
				(true, false) => format!("reopened {id}"),
				(false, _) => format!("no task {id} today"),
			}
		}
		EventLine::DeleteTask(id) => {
			let task_id = id.clone();
			let found = handle
				.call(move |companion| {
					let today = companion.today();
					companion.delete_task(today, &task_id)
				})
				.await?;
			if found {
				format!("deleted {id}")
			} else {
				format!("no task {id} today")
			}
		}
		EventLine::SetMemo(text) => {
			handle
				.call(move |companion| {
					let today = companion.today();
					companion.set_memo(today, &text)
				})
				.await?;
			"memo saved".to_string()
		}
		EventLine::SetPreset { slot, minutes } => {
			match handle
				.call(move |companion| companion.set_timer_preset(slot, minutes))
				.await?
			{
				Some(minutes) => format!("slot {}: {minutes} min", slot + 1),
				None => return Ok(None),
			}
		}
		EventLine::SetIcon(id) => {
			let icon = handle
				.call(move |companion| {
					companion.set_selected_app_icon_id(id.as_deref());
					companion.ledger().selected_app_icon_id().map(str::to_string)
				})
				.await?;
			icon.unwrap_or_else(|| "default".to_string())
		}
		EventLine::SetBackground(path) => {
			let filename = handle
				.call(move |companion| companion.set_background(&path))
				.await??;
			format!("background stored as {filename}")
		}
		EventLine::ClearBackground => {
			if handle.call(|companion| companion.clear_background()).await? {
				"background cleared".to_string()
			} else {
				"no background image".to_string()
			}
		}
		EventLine::Export(path) => {
			handle.export_to(path.clone()).await?;
			format!("exported to {}", path.display())
		}
		EventLine::Import(path) => {
			handle.import_from(path.clone()).await?;
			format!("imported {}", path.display())
		}
		EventLine::ResetAll => {
			handle.call(|companion| companion.reset_all()).await?;
			"all data cleared".to_string()
		}
		EventLine::Usage => format_usage(&handle.call(|companion| companion.usage_today()).await?),
		EventLine::Flush => {
			handle.flush().await?;
			"saved".to_string()
		}
		EventLine::Quit => return Ok(None),
	};
	Ok(Some(reply))
}

fn parse_day(store: &Store, input: Option<&str>) -> Result<NaiveDate, Box<dyn Error>> {
	match input {
		Some(raw) => {
			parse_day_key(raw).ok_or_else(|| format!("invalid day {raw}, expected YYYY-MM-DD").into())
		}
		None => Ok(store.day_of(Utc::now())),
	}
}

fn require_task(found: bool, task_id: &str, day: NaiveDate) -> Result<(), Box<dyn Error>> {
	if found {
		Ok(())
	} else {
		Err(format!("no task {task_id} on {}", day.format("%Y-%m-%d")).into())
	}
}

fn format_usage(report: &UsageReport) -> String {
	let mut lines = vec![format!("usage for {}", report.day.format("%Y-%m-%d"))];
	if report.rows.is_empty() {
		lines.push("no tracked apps".to_string());
		return lines.join("\n");
	}

	for row in &report.rows {
		lines.push(format!(
			"{} | {} | {}",
			format_duration(row.seconds),
			row.target.bundle_id,
			row.target.display_name
		));
	}
	lines.push(format!("{} | total", format_duration(report.total_seconds)));
	lines.join("\n")
}

fn print_tasks(store: &Store, day: NaiveDate) {
	let ledger = store.ledger();
	let open = ledger.open_tasks(day);
	let completed = ledger.completed_tasks(day);
	if open.is_empty() && completed.is_empty() {
		println!("no tasks for {}", day.format("%Y-%m-%d"));
		return;
	}

	for task in open {
		println!("[ ] {} | {}", task.id, task.title);
	}
	for task in completed {
		println!("[x] {} | {}", task.id, task.title);
	}
}
