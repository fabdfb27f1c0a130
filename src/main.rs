mod alarm;
mod api;
mod clock;
mod runtime;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::alarm::model::{AlarmDefinition, AlarmError};
use crate::alarm::occurrence::next_occurrence;
use crate::alarm::scheduler::{
    AlarmEngine, OneShotPolicy, TimeDisplayMode, format_next_occurrence_with_mode, next_due_at,
};
use crate::alarm::store::{AlarmStore, JsonFileBackend, StoreLock};
use crate::alarm::trigger::{CommandSink, FanoutSink, FiredLog, LogSink};
use crate::api::{ApiServer, ApiServerConfig};
use crate::clock::SystemClock;
use crate::runtime::run_scheduler_loop;

const FIRED_HISTORY: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliOneShot {
    Deactivate,
    RollOver,
}

impl From<CliOneShot> for OneShotPolicy {
    fn from(value: CliOneShot) -> Self {
        match value {
            CliOneShot::Deactivate => OneShotPolicy::Deactivate,
            CliOneShot::RollOver => OneShotPolicy::RollOver,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "alarmkeeper",
    version,
    about = "Persistent weekly alarm scheduler"
)]
struct Cli {
    #[arg(long, global = true, default_value = "alarms.json")]
    alarms: PathBuf,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true)]
    hour12: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and the local HTTP API until killed.
    Run {
        #[arg(long, default_value = "127.0.0.1")]
        api_bind: String,

        #[arg(long, default_value_t = 8099)]
        api_port: u16,

        #[arg(long)]
        no_api: bool,

        #[arg(long, value_enum, default_value_t = CliOneShot::Deactivate)]
        one_shot: CliOneShot,

        /// Shell command run for every fired alarm.
        #[arg(long)]
        on_fire: Option<String>,
    },
    /// Print every alarm with its next occurrence.
    List,
    /// Add an alarm and print its id.
    Add {
        #[arg(long)]
        time: String,

        #[arg(long)]
        label: Option<String>,

        /// Repeat weekdays, 0 = Sunday.
        #[arg(long, value_delimiter = ',')]
        days: Vec<i64>,
    },
    #[command(group(ArgGroup::new("state").required(true).args(["on", "off"])))]
    Toggle {
        id: String,

        #[arg(long)]
        on: bool,

        #[arg(long)]
        off: bool,
    },
    Delete {
        id: String,
    },
    /// Print the next alarm instant and every alarm due at it.
    Next,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    // Read-only commands never write, so they do not need to own the file.
    let _lock = match cli.command {
        Command::List | Command::Next => None,
        _ => Some(StoreLock::acquire(&cli.alarms)?),
    };
    let backend = JsonFileBackend::new(&cli.alarms);
    let display_path = backend.path().display().to_string();
    let mut store =
        AlarmStore::open(backend).with_context(|| format!("failed to load {display_path}"))?;
    let mode = if cli.hour12 {
        TimeDisplayMode::Hour12
    } else {
        TimeDisplayMode::Hour24
    };

    match cli.command {
        Command::Run {
            api_bind,
            api_port,
            no_api,
            one_shot,
            on_fire,
        } => run_daemon(store, api_bind, api_port, no_api, one_shot.into(), on_fire),
        Command::List => {
            if store.is_empty() {
                println!("no alarms");
                return Ok(());
            }
            let now = Local::now();
            for alarm in store.list() {
                let next = alarm
                    .is_active
                    .then(|| next_occurrence(alarm, &now))
                    .flatten();
                println!(
                    "{}  {}  {:<3}  {:<27}  {:<24}  next: {}",
                    alarm.id,
                    alarm.time,
                    if alarm.is_active { "on" } else { "off" },
                    alarm.repeat_summary(),
                    alarm.label,
                    format_next_occurrence_with_mode(next.as_ref(), mode)
                );
            }
            Ok(())
        }
        Command::Add { time, label, days } => {
            let alarm = store.add(&AlarmDefinition::new(time, label, days))?;
            ensure_saved(&store)?;
            println!("{}", alarm.id);
            Ok(())
        }
        Command::Toggle { id, on, off } => {
            let active = on && !off;
            if !store.toggle(&id, active) {
                return Err(AlarmError::UnknownAlarm(id).into());
            }
            ensure_saved(&store)?;
            println!("{id} {}", if active { "on" } else { "off" });
            Ok(())
        }
        Command::Delete { id } => {
            let Some(removed) = store.delete(&id) else {
                return Err(AlarmError::UnknownAlarm(id).into());
            };
            ensure_saved(&store)?;
            println!("deleted {} ({} {})", removed.id, removed.time, removed.label);
            Ok(())
        }
        Command::Next => {
            let Some((target, due)) = next_due_at(&store, &Local::now()) else {
                println!("no upcoming alarms");
                return Ok(());
            };
            println!("next: {}", format_next_occurrence_with_mode(Some(&target), mode));
            for alarm in due {
                println!("  {}  {}  {}", alarm.id, alarm.time, alarm.label);
            }
            Ok(())
        }
    }
}

/// One-off commands have no later save to fall back on.
fn ensure_saved(store: &AlarmStore) -> Result<()> {
    match store.last_persist_error() {
        Some(err) => bail!("alarm change was not saved: {err}"),
        None => Ok(()),
    }
}

fn run_daemon(
    store: AlarmStore,
    api_bind: String,
    api_port: u16,
    no_api: bool,
    one_shot: OneShotPolicy,
    on_fire: Option<String>,
) -> Result<()> {
    let (clock, fired_rx) = SystemClock::new();
    let history = FiredLog::new(FIRED_HISTORY);
    let mut sink = FanoutSink::new().with(LogSink).with(history.clone());
    if let Some(command) = on_fire {
        sink = sink.with(CommandSink::new(command));
    }

    let engine = Arc::new(Mutex::new(AlarmEngine::new(store, clock, sink, one_shot)));
    info!(policy = ?one_shot, "alarm scheduler started");

    let api_server = if no_api {
        None
    } else {
        let server = ApiServer::start(
            ApiServerConfig {
                bind_addr: api_bind.clone(),
                port: api_port,
            },
            Arc::clone(&engine),
            history,
        )
        .with_context(|| format!("failed to start local API at {api_bind}:{api_port}"))?;
        Some(server)
    };

    let stop = Arc::new(AtomicBool::new(false));
    run_scheduler_loop(engine, fired_rx, stop);

    drop(api_server);
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
