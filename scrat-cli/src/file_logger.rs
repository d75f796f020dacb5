use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use flexi_logger::writers::LogWriter;
use flexi_logger::{DeferredNow, Logger, LoggerHandle, WriteMode};
use log::{LevelFilter, Record};
use scrat_lib::shared::events::{Event, EventMessage};
use scrat_lib::shared::message::{ErrorMessage, InfoMessage, Message, WarnMessage};

/// Walks an error's `.source()` chain into a single multi-line string.
fn trace_error(err: &dyn std::error::Error) -> String {
    let mut msg = format!("{}", err);
    let mut source = err.source();

    while let Some(err) = source {
        msg.push_str(&format!("\nCaused by: {}", err));
        source = err.source();
    }

    msg
}

struct LogFile {
    file: Mutex<std::fs::File>,
    log_levels: Vec<log::Level>,
}

impl LogFile {
    fn new(file_name: &str, log_levels: Vec<log::Level>) -> Self {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(file_name)
            .unwrap();

        LogFile {
            file: Mutex::new(file),
            log_levels,
        }
    }

    fn accepts_level(&self, level: log::Level) -> bool {
        self.log_levels.contains(&level)
    }

    fn write(&self, msg: &str) -> std::io::Result<()> {
        self.file.lock().unwrap().write_all(msg.as_bytes())
    }

    fn flush(&self) -> std::io::Result<()> {
        self.file.lock().unwrap().flush()
    }
}

struct LevelFileLogWriter {
    log_files: Vec<LogFile>,
}

impl LevelFileLogWriter {
    fn new() -> Self {
        LevelFileLogWriter { log_files: Vec::new() }
    }

    fn add_log_file(&mut self, file_name: &str, log_levels: Vec<log::Level>) {
        self.log_files.push(LogFile::new(file_name, log_levels));
    }
}

impl LogWriter for LevelFileLogWriter {
    fn write(&self, _now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
        let log_msg = format!("{} {}\n", record.level(), record.args());

        for log_file in self.log_files.iter().filter(|log_file| log_file.accepts_level(record.level())) {
            log_file.write(log_msg.as_str())?;
        }

        Ok(())
    }

    fn flush(&self) -> std::io::Result<()> {
        for log_file in self.log_files.iter() {
            let _ = log_file.flush();
        }

        Ok(())
    }
}

/// Prepares a logger that routes event-bus messages to files based on level.
pub struct LogBuilder {
    receiver: Arc<Receiver<Arc<dyn Message>>>,
    log_writer: LevelFileLogWriter,
}

impl LogBuilder {
    pub fn new(receiver: Arc<Receiver<Arc<dyn Message>>>) -> Self {
        LogBuilder {
            receiver,
            log_writer: LevelFileLogWriter::new(),
        }
    }

    pub fn add_log_file(mut self, accept: Vec<log::Level>, file_name: &str) -> Self {
        self.log_writer.add_log_file(file_name, accept);
        self
    }

    pub fn build(self) -> Log {
        Log {
            receiver: self.receiver,
            shutdown_sender: None,
            thread_handle: None,
            logger_handle: Some(
                Logger::with(LevelFilter::Debug)
                    .log_to_writer(Box::new(self.log_writer))
                    .write_mode(WriteMode::Direct)
                    .start()
                    .unwrap(),
            ),
        }
    }
}

/// A logger that routes event-bus messages to per-level files.
pub struct Log {
    receiver: Arc<Receiver<Arc<dyn Message>>>,
    shutdown_sender: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    logger_handle: Option<LoggerHandle>,
}

impl Log {
    pub fn start(&mut self) {
        let receiver = Arc::clone(&self.receiver);
        let (shutdown_sender, shutdown_receiver) = unbounded();
        self.shutdown_sender = Some(shutdown_sender);

        self.thread_handle = Some(thread::spawn(move || {
            loop {
                select! {
                    recv(receiver) -> message => {
                        if let Ok(message) = message {
                            log_message(message.as_ref());
                        }
                    },
                    recv(shutdown_receiver) -> _ => break,
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(sender) = self.shutdown_sender.take() {
            thread::sleep(Duration::from_millis(100));
            let _ = sender.send(());
        }

        if let Some(handle) = self.thread_handle.take() {
            handle.join().unwrap();
        }

        if let Some(logger_handle) = self.logger_handle.take() {
            logger_handle.flush();
        }
    }
}

fn log_message(message: &dyn Message) {
    if let Some(event_message) = message.as_any().downcast_ref::<EventMessage>() {
        log_event(event_message.event());
    } else if let Some(info_message) = message.as_any().downcast_ref::<InfoMessage>() {
        if let Some(info) = info_message.info() {
            log::info!("{}", info);
        }
    } else if let Some(warn_message) = message.as_any().downcast_ref::<WarnMessage>() {
        if let Some(info) = warn_message.info() {
            log::warn!("{}", info);
        }
    } else if let Some(error_message) = message.as_any().downcast_ref::<ErrorMessage>() {
        if let Some(err) = error_message.err() {
            log::error!("{}", trace_error(err));
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::BackupCompleted { run_id, stats } => {
            log::info!(
                "backup {run_id} completed: {} files, {} bytes stored in {:.1}s",
                stats.files_total,
                stats.size_stored,
                stats.duration_seconds
            );
        }
        Event::BackupFailed { run_id, kind, message } => log::error!("backup {run_id} failed ({kind}): {message}"),
        Event::RestoreCompleted { run_id } => log::info!("restore {run_id} completed"),
        Event::RestoreFailed { run_id, kind, message } => log::error!("restore {run_id} failed ({kind}): {message}"),
        Event::StorageConnected { dest_id } => log::info!("connected to {dest_id}"),
        Event::StorageDisconnected { dest_id } => log::info!("disconnected from {dest_id}"),
        Event::ConfigChanged { kind } => log::info!("config changed: {kind}"),
        Event::MissedRuns { runs } => {
            for run in runs {
                log::warn!("schedule {} missed its run at {}", run.schedule_id, run.scheduled_for);
            }
        }
        // Started/progress events are too frequent to be worth a file record.
        Event::BackupStarted { .. }
        | Event::RestoreStarted { .. }
        | Event::BackupProgress { .. }
        | Event::RestoreProgress { .. } => {}
    }
}
