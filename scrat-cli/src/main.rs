mod cli_cmds;
mod console_out;
mod file_logger;
mod progress_bars;

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use crossbeam_channel::{Sender, unbounded};
use inquire::Password;
use secrecy::SecretString;

use scrat_lib::core::api::Scrat;
use scrat_lib::core::backup_engine::BackupKindRequest;
use scrat_lib::core::restore_engine::RestoreSelection;
use scrat_lib::send_error;
use scrat_lib::send_info;
use scrat_lib::shared::config::{
    ConfigEntryKey, ConfigEntryType, EXAMPLE_CONFIG, load_config_from_file,
};
use scrat_lib::shared::config_writer::ConfigWriter;
use scrat_lib::shared::message::{Message, StringError};
use scrat_lib::shared::msg_dispatcher::MsgDispatcher;
use scrat_lib::shared::relpath::RelPath;

use crate::cli_cmds::{
    Cli, ConfigCommands, ConfigExampleCommands, MainCommands, PasswordCommands, ScheduleCommands,
};
use crate::console_out::ConsoleOut;
use crate::file_logger::{Log, LogBuilder};
use crate::progress_bars::ProgressBars;

const CONFIG_PATH: &str = "scrat.toml";

/// A macro that subscribes the `Log` to the `MsgDispatcher`. Both arguments
/// are `&mut` places so the same macro works whether they're held directly
/// (as in `main`) or threaded through as function parameters (as in
/// `run_command`).
macro_rules! use_logger {
    ($msg_logger:expr, $msg_dispatcher:expr) => {{
        let logger_receiver = $msg_dispatcher.subscribe();
        let logger = LogBuilder::new(Arc::new(logger_receiver))
            .add_log_file(vec![log::Level::Info], "scrat.info.log")
            .add_log_file(vec![log::Level::Warn], "scrat.warn.log")
            .add_log_file(vec![log::Level::Error], "scrat.error.log")
            .build();
        *$msg_logger = Some(logger);

        if let Some(logger) = $msg_logger.as_mut() {
            logger.start();
        }
    }};
}

/// A macro that unsubscribes the `Log` from the `MsgDispatcher`.
macro_rules! unuse_logger {
    ($msg_logger:expr, $msg_dispatcher:expr) => {{
        let _ = &$msg_dispatcher;
        if let Some(mut logger) = $msg_logger.take() {
            logger.stop();
        }
    }};
}

/// A macro that subscribes the `ConsoleOut` to the `MsgDispatcher`.
macro_rules! use_console_out {
    ($msg_console_out:expr, $msg_dispatcher:expr) => {{
        let console_out_receiver = $msg_dispatcher.subscribe();
        *$msg_console_out = Some(ConsoleOut::new(Arc::new(console_out_receiver)));

        if let Some(console_out) = $msg_console_out.as_mut() {
            console_out.start();
        }
    }};
}

/// A macro that unsubscribes the `ConsoleOut` from the `MsgDispatcher`.
macro_rules! unuse_console_out {
    ($msg_console_out:expr, $msg_dispatcher:expr) => {{
        let _ = &$msg_dispatcher;
        if let Some(mut console_out) = $msg_console_out.take() {
            console_out.stop();
        }
    }};
}

/// A macro that subscribes the `ProgressBars` to the `MsgDispatcher`.
macro_rules! use_progress {
    ($msg_progress_bars:expr, $msg_dispatcher:expr) => {{
        let progress_receiver = $msg_dispatcher.subscribe();
        *$msg_progress_bars = Some(ProgressBars::new(Arc::new(progress_receiver)));

        if let Some(progress) = $msg_progress_bars.as_mut() {
            progress.start();
        }
    }};
}

/// A macro that unsubscribes the `ProgressBars` from the `MsgDispatcher`.
macro_rules! unuse_progress {
    ($msg_progress_bars:expr, $msg_dispatcher:expr) => {{
        let _ = &$msg_dispatcher;
        if let Some(mut progress) = $msg_progress_bars.take() {
            progress.stop();
        }
    }};
}

/// Prompts twice for a password, retrying until both entries match.
fn prompt_password(sender: Sender<Arc<dyn Message>>) -> SecretString {
    loop {
        let password_input = Password::new("Enter your password:").without_confirmation().prompt();

        let password = match password_input {
            Ok(password_ok) if !password_ok.is_empty() => password_ok,
            _ => {
                send_error!(sender.clone(), StringError::new("Password cannot be empty. Try again.".to_string()));
                continue;
            }
        };

        let confirm_input = Password::new("Confirm your password:").without_confirmation().prompt();

        match confirm_input {
            Ok(confirm) if confirm == password => return SecretString::new(password.into()),
            Ok(_) => send_error!(sender.clone(), StringError::new("Passwords do not match. Try again.".to_string())),
            Err(_) => send_error!(sender.clone(), StringError::new("Failed to read confirmation. Try again.".to_string())),
        }
    }
}

/// Writes the example config to `scrat.toml`, prompting before overwriting.
fn write_example_config(sender: Sender<Arc<dyn Message>>) {
    let path = Path::new(CONFIG_PATH);

    if path.exists() {
        print!("{CONFIG_PATH} already exists. Overwrite? [y/N]: ");
        if let Err(error) = io::stdout().flush() {
            send_error!(sender.clone(), error);
            return;
        }

        let mut input = String::new();
        if let Err(error) = io::stdin().read_line(&mut input) {
            send_error!(sender.clone(), error);
            return;
        }

        let trimmed = input.trim().to_lowercase();
        if trimmed != "y" && trimmed != "yes" {
            send_error!(sender.clone(), StringError::new("Aborted. Existing file was not overwritten.".to_string()));
            return;
        }
    }

    match fs::write(path, EXAMPLE_CONFIG) {
        Ok(_) => send_info!(sender, "Example config written to {CONFIG_PATH}"),
        Err(error) => send_error!(sender.clone(), error),
    }
}

fn parse_entry_type(sender: Sender<Arc<dyn Message>>, raw: &str) -> Option<ConfigEntryType> {
    match raw {
        "source" => Some(ConfigEntryType::Source),
        "destination" => Some(ConfigEntryType::Destination),
        "schedule" => Some(ConfigEntryType::Schedule),
        other => {
            send_error!(sender, StringError::new(format!("unknown entry type {other:?}, expected source/destination/schedule")));
            None
        }
    }
}

fn parse_timestamp(sender: Sender<Arc<dyn Message>>, raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&chrono::Utc)),
        Err(err) => {
            send_error!(sender, err);
            None
        }
    }
}

fn main() {
    let (sender, receiver) = unbounded::<Arc<dyn Message>>();
    let arc_receiver = Arc::new(receiver);

    let mut msg_dispatcher = MsgDispatcher::new(arc_receiver);
    msg_dispatcher.start();

    #[allow(unused_assignments)]
    let mut msg_console_out: Option<ConsoleOut> = None;
    #[allow(unused_assignments)]
    let mut msg_logger: Option<Log> = None;
    #[allow(unused_assignments)]
    let mut msg_progress_bars: Option<ProgressBars> = None;

    use_logger!(&mut msg_logger, msg_dispatcher);
    use_console_out!(&mut msg_console_out, msg_dispatcher);

    if std::env::args().len() == 1 {
        Cli::command().print_help().unwrap();
    } else {
        let mut scrat = Scrat::new(sender.clone());

        if let Some(config) = load_config_from_file(sender.clone(), CONFIG_PATH) {
            scrat.set_config(config);
        }

        if let Err(err) = scrat.open_store(Path::new("scrat.db")) {
            send_error!(sender.clone(), err);
        }

        match Cli::try_parse() {
            Ok(cli) => run_command(&mut scrat, cli.command, sender.clone(), &mut msg_console_out, &mut msg_progress_bars, &mut msg_dispatcher),
            Err(err) => send_error!(sender.clone(), StringError::new(format!("{}", err))),
        }
    }

    unuse_logger!(&mut msg_logger, msg_dispatcher);
    unuse_console_out!(&mut msg_console_out, msg_dispatcher);
    msg_dispatcher.stop();
}

fn run_command(
    scrat: &mut Scrat,
    command: MainCommands,
    sender: Sender<Arc<dyn Message>>,
    msg_console_out: &mut Option<ConsoleOut>,
    msg_progress_bars: &mut Option<ProgressBars>,
    msg_dispatcher: &mut MsgDispatcher<Arc<dyn Message>>,
) {
    match command {
        MainCommands::Backup { sources, destination, full, incremental } => {
            let kind = if full {
                BackupKindRequest::Full
            } else if incremental {
                BackupKindRequest::Incremental
            } else {
                BackupKindRequest::Auto
            };

            let passphrase = prompt_password(sender.clone());
            send_info!(sender, "Starting backup of {:?} to {destination}", sources);
            unuse_console_out!(msg_console_out, msg_dispatcher);
            use_progress!(msg_progress_bars, msg_dispatcher);

            let result = scrat.run_backup(&sources, &destination, kind, passphrase);

            unuse_progress!(msg_progress_bars, msg_dispatcher);
            use_console_out!(msg_console_out, msg_dispatcher);
            match result {
                Some(backup_id) => send_info!(sender, "Backup finished: {backup_id}"),
                None => send_error!(sender, StringError::new("Backup did not complete".to_string())),
            }
        }
        MainCommands::Cancel => {
            scrat.cancel_running_operation();
        }
        MainCommands::ListRestorable { destination } => {
            if let Some(points) = scrat.list_restorable_points(&destination) {
                for point in points {
                    println!("{}\t{}\t{:?}", point.backup_id, point.timestamp, point.kind);
                }
            }
        }
        MainCommands::ListFiles { destination, at } => {
            let Some(at) = parse_timestamp(sender.clone(), &at) else { return };
            if let Some(states) = scrat.resolve_file_state(&destination, at) {
                for state in states {
                    println!("{}\t{} bytes", state.relative_path, state.size);
                }
            }
        }
        MainCommands::Restore { destination, at, target, paths } => {
            let Some(at) = parse_timestamp(sender.clone(), &at) else { return };
            let selection = if paths.is_empty() {
                RestoreSelection::All
            } else {
                RestoreSelection::Paths(paths.into_iter().map(RelPath::from_normalized).collect())
            };

            let passphrase = prompt_password(sender.clone());
            send_info!(sender, "Starting restore of {destination} as of {at}");
            unuse_console_out!(msg_console_out, msg_dispatcher);
            use_progress!(msg_progress_bars, msg_dispatcher);

            let result = scrat.run_restore(&destination, at, selection, target, passphrase);

            unuse_progress!(msg_progress_bars, msg_dispatcher);
            use_console_out!(msg_console_out, msg_dispatcher);
            match result {
                Some(stats) => send_info!(sender, "Restore finished: {} files restored", stats.files_restored),
                None => send_error!(sender, StringError::new("Restore did not complete".to_string())),
            }
        }
        MainCommands::TestDestination { destination } => match scrat.test_destination(&destination) {
            Some(true) => send_info!(sender, "{destination} is reachable"),
            Some(false) => send_error!(sender, StringError::new(format!("{destination} is not reachable"))),
            None => {}
        },
        MainCommands::Log { backup, limit } => {
            if let Some(entries) = scrat.recent_logs(backup.as_deref(), limit) {
                for entry in entries {
                    println!("{}\t{}\t{}\t{}", entry.ts, entry.level, entry.backup_id.as_deref().unwrap_or("-"), entry.message);
                }
            }
        }
        MainCommands::Schedule { command } => match command {
            ScheduleCommands::Start => {
                scrat.start_scheduler();
                send_info!(sender, "Scheduler started, running in the foreground. Ctrl-C to stop.");
                // The scheduler's own tick thread does the real waiting; this
                // just keeps the process (and its job worker thread) alive.
                loop {
                    std::thread::sleep(std::time::Duration::from_secs(60));
                }
            }
            ScheduleCommands::Stop => {
                scrat.stop_scheduler();
                send_info!(sender, "Scheduler stopped");
            }
            ScheduleCommands::TriggerDue => {
                scrat.trigger_due_schedules_now();
            }
            ScheduleCommands::RunNow { schedule } => {
                scrat.run_schedule_now(&schedule);
            }
        },
        MainCommands::Password { command } => match command {
            PasswordCommands::Set { id } => {
                let password = prompt_password(sender.clone());
                scrat.set_password(&id, &password);
            }
            PasswordCommands::Delete { id } => {
                scrat.delete_password(&id);
            }
        },
        MainCommands::Config { command } => match command {
            ConfigCommands::List => {
                if let Some(keys) = scrat.list_entry_keys() {
                    for key in keys {
                        println!("{key}");
                    }
                }
            }
            ConfigCommands::Add { entry_type, name } => {
                if let Some(entry_type) = parse_entry_type(sender.clone(), &entry_type) {
                    scrat.add_entry(entry_type, &name);
                    if let Some(config) = scrat.config() {
                        ConfigWriter::write(sender, Path::new(CONFIG_PATH), &config);
                    }
                }
            }
            ConfigCommands::Delete { entry_type, name } => {
                if let Some(entry_type) = parse_entry_type(sender.clone(), &entry_type) {
                    scrat.delete_entry(&ConfigEntryKey { entry_type, name });
                    if let Some(config) = scrat.config() {
                        ConfigWriter::write(sender, Path::new(CONFIG_PATH), &config);
                    }
                }
            }
            ConfigCommands::Example { command } => match command {
                ConfigExampleCommands::Show => println!("{}", EXAMPLE_CONFIG),
                ConfigExampleCommands::Write => write_example_config(sender),
            },
        },
    }
}
