use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use scrat_lib::shared::events::{Event, EventMessage};
use scrat_lib::shared::message::Message;

/// Visualizes `Event::{Backup,Restore}Progress` as one bar per run. Unlike
/// the corpus's thread-indexed bars, a run here maps to a `run_id`, not a
/// worker slot, so bars are created and torn down as runs start/finish
/// rather than allocated up front for a fixed thread count.
pub struct ProgressBars {
    receiver: Arc<Receiver<Arc<dyn Message>>>,
    shutdown_sender: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ProgressBars {
    pub fn new(receiver: Arc<Receiver<Arc<dyn Message>>>) -> Self {
        ProgressBars {
            receiver,
            shutdown_sender: None,
            thread_handle: None,
        }
    }

    pub fn start(&mut self) {
        let receiver = Arc::clone(&self.receiver);
        let (shutdown_sender, shutdown_receiver) = unbounded();
        self.shutdown_sender = Some(shutdown_sender);

        self.thread_handle = Some(thread::spawn(move || {
            let multi_progress = MultiProgress::new();
            let bars: Mutex<HashMap<String, ProgressBar>> = Mutex::new(HashMap::new());
            let style = ProgressStyle::with_template("{prefix:.bold.dim} [{wide_bar:.green}] {percent}% {wide_msg}")
                .unwrap()
                .progress_chars(". ");

            loop {
                crossbeam_channel::select! {
                    recv(receiver) -> msg => {
                        match msg {
                            Ok(message) => {
                                if let Some(event_message) = message.as_any().downcast_ref::<EventMessage>() {
                                    handle_event(event_message.event(), &multi_progress, &bars, &style);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    recv(shutdown_receiver) -> _ => break,
                }
            }

            for (_, bar) in bars.lock().unwrap().drain() {
                bar.finish_and_clear();
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(sender) = self.shutdown_sender.take() {
            let _ = sender.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_event(event: &Event, multi_progress: &MultiProgress, bars: &Mutex<HashMap<String, ProgressBar>>, style: &ProgressStyle) {
    match event {
        Event::BackupStarted { run_id } => {
            add_bar(run_id, "backup", multi_progress, bars, style);
        }
        Event::BackupProgress {
            run_id,
            bytes_done,
            bytes_total,
            current_path,
            ..
        } => {
            update_bar(run_id, *bytes_done, *bytes_total, current_path, bars);
        }
        Event::BackupCompleted { run_id, .. } => finish_bar(run_id, "backup complete", bars),
        Event::BackupFailed { run_id, message, .. } => finish_bar(run_id, &format!("backup failed: {message}"), bars),
        Event::RestoreStarted { run_id } => {
            add_bar(run_id, "restore", multi_progress, bars, style);
        }
        Event::RestoreProgress {
            run_id,
            bytes_done,
            bytes_total,
            current_path,
            ..
        } => {
            update_bar(run_id, *bytes_done, *bytes_total, current_path, bars);
        }
        Event::RestoreCompleted { run_id } => finish_bar(run_id, "restore complete", bars),
        Event::RestoreFailed { run_id, message, .. } => finish_bar(run_id, &format!("restore failed: {message}"), bars),
        _ => {}
    }
}

fn add_bar(run_id: &str, prefix: &str, multi_progress: &MultiProgress, bars: &Mutex<HashMap<String, ProgressBar>>, style: &ProgressStyle) {
    let bar = multi_progress.add(ProgressBar::new(0));
    bar.set_style(style.clone());
    bar.set_prefix(format!("[{prefix} {run_id}]"));
    bars.lock().unwrap().insert(run_id.to_string(), bar);
}

fn update_bar(run_id: &str, bytes_done: u64, bytes_total: u64, current_path: &str, bars: &Mutex<HashMap<String, ProgressBar>>) {
    if let Some(bar) = bars.lock().unwrap().get(run_id) {
        bar.set_length(bytes_total.max(1));
        bar.set_position(bytes_done);
        bar.set_message(current_path.to_string());
    }
}

fn finish_bar(run_id: &str, message: &str, bars: &Mutex<HashMap<String, ProgressBar>>) {
    if let Some(bar) = bars.lock().unwrap().remove(run_id) {
        bar.finish_with_message(message.to_string());
    }
}
