use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use console::Style;
use crossbeam_channel::{Receiver, Sender, unbounded};
use scrat_lib::shared::events::{Event, EventMessage};
use scrat_lib::shared::message::{ErrorMessage, InfoMessage, Message, WarnMessage};

/// Prints event-bus messages to the terminal. Unsubscribed whenever the
/// progress bars are up, so the two never fight over the same lines.
pub struct ConsoleOut {
    receiver: Arc<Receiver<Arc<dyn Message>>>,
    shutdown_sender: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ConsoleOut {
    pub fn new(receiver: Arc<Receiver<Arc<dyn Message>>>) -> Self {
        ConsoleOut {
            receiver,
            shutdown_sender: None,
            thread_handle: None,
        }
    }

    pub fn start(&mut self) {
        let receiver = Arc::clone(&self.receiver);
        let (shutdown_sender, shutdown_receiver) = unbounded();
        self.shutdown_sender = Some(shutdown_sender);

        let green = Style::new().green();
        let yellow = Style::new().yellow();
        let red = Style::new().red();

        self.thread_handle = Some(thread::spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(receiver) -> msg => {
                        match msg {
                            Ok(message) => print_message(&message, &green, &yellow, &red),
                            Err(_) => break,
                        }
                    }
                    recv(shutdown_receiver) -> _ => break,
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        // Let already-queued messages drain before we stop reading them.
        thread::sleep(Duration::from_millis(100));

        if let Some(sender) = self.shutdown_sender.take() {
            let _ = sender.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

fn print_message(message: &Arc<dyn Message>, green: &Style, yellow: &Style, red: &Style) {
    if let Some(event_message) = message.as_any().downcast_ref::<EventMessage>() {
        print_event(event_message.event(), green, red);
        return;
    }

    if let Some(info_message) = message.as_any().downcast_ref::<InfoMessage>() {
        println!("{}", green.apply_to(info_message));
        return;
    }

    if let Some(warn_message) = message.as_any().downcast_ref::<WarnMessage>() {
        println!("{}", yellow.apply_to(warn_message));
        return;
    }

    if let Some(error_message) = message.as_any().downcast_ref::<ErrorMessage>() {
        println!("{}", red.apply_to(error_message));
    }
}

fn print_event(event: &Event, green: &Style, red: &Style) {
    match event {
        Event::BackupStarted { run_id } => println!("{}", green.apply_to(format!("Backup {run_id} started"))),
        Event::BackupCompleted { run_id, stats } => println!(
            "{}",
            green.apply_to(format!(
                "Backup {run_id} completed: {} files, {} bytes stored in {:.1}s",
                stats.files_total, stats.size_stored, stats.duration_seconds
            ))
        ),
        Event::BackupFailed { run_id, kind, message } => {
            println!("{}", red.apply_to(format!("Backup {run_id} failed ({kind}): {message}")))
        }
        Event::RestoreStarted { run_id } => println!("{}", green.apply_to(format!("Restore {run_id} started"))),
        Event::RestoreCompleted { run_id } => println!("{}", green.apply_to(format!("Restore {run_id} completed"))),
        Event::RestoreFailed { run_id, kind, message } => {
            println!("{}", red.apply_to(format!("Restore {run_id} failed ({kind}): {message}")))
        }
        Event::StorageConnected { dest_id } => println!("Connected to {dest_id}"),
        Event::StorageDisconnected { dest_id } => println!("Disconnected from {dest_id}"),
        Event::ConfigChanged { kind } => println!("Config changed: {kind}"),
        Event::MissedRuns { runs } => {
            for run in runs {
                println!(
                    "{}",
                    red.apply_to(format!("Schedule {} missed its run at {}", run.schedule_id, run.scheduled_for))
                );
            }
        }
        // Progress events are handled by ProgressBars, not ConsoleOut.
        Event::BackupProgress { .. } | Event::RestoreProgress { .. } => {}
    }
}
