use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use secrecy::{ExposeSecret, SecretString};

use crate::core::backup_engine::{self, BackupKindRequest, BackupRequest};
use crate::core::destination::Destination;
use crate::core::destination::{LocalDestination, SftpDestination, ShelledDestination, SmbDestination, WebDavDestination};
use crate::core::keyring;
use crate::core::metadata_store::{MetadataStore, RestorablePoint};
use crate::core::password_cache::PasswordCache;
use crate::core::restore_engine::{self, FileState, RestoreRequest, RestoreSelection, RestoreStats};
use crate::core::run_state::RunState;
use crate::core::scheduler::{ScheduledJob, Scheduler};
use crate::send_error;
use crate::shared::config::{Config, ConfigEntryKey, ConfigEntryType, Destination as DestinationConfig, DestinationKind};
use crate::shared::message::Message;
use crate::ScratError;

/// The fixed top-level directory every destination keeps its catalog under
/// (§6.1). Shared by the backup/restore/rotation/verify call sites so
/// there is exactly one place that names it.
pub const REMOTE_ROOT: &str = "scrat-backup";

/// Facade over the engine (§6.4's command surface), the one type the CLI
/// (or any other host) talks to. Mirrors the corpus's `Cuba`: a config slot
/// guarded by [`Scrat::requires_config`], an event sender every operation
/// narrates over, and one method per command. Config and the metadata
/// catalog are each wrapped in `Arc<Mutex<_>>` rather than owned directly,
/// because unlike the corpus's `Cuba` this facade also owns a background
/// scheduler thread that reads and mutates schedules concurrently with
/// whatever thread the host runs commands on.
pub struct Scrat {
    config: Option<Arc<Mutex<Config>>>,
    store: Option<Arc<Mutex<MetadataStore>>>,
    sender: Sender<Arc<dyn Message>>,
    password_cache: Arc<Mutex<PasswordCache>>,
    run_state: Arc<RunState>,
    scheduler: Option<Scheduler>,
    job_receiver: Option<Receiver<ScheduledJob>>,
    worker_shutdown: Option<Sender<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl Scrat {
    pub fn new(sender: Sender<Arc<dyn Message>>) -> Self {
        Scrat {
            config: None,
            store: None,
            sender,
            password_cache: Arc::new(Mutex::new(PasswordCache::new())),
            run_state: Arc::new(RunState::new()),
            scheduler: None,
            job_receiver: None,
            worker_shutdown: None,
            worker_thread: None,
        }
    }

    /// Runs a closure against the loaded config, or narrates a validation
    /// error over the event bus and returns `None` (§9: engine never
    /// panics on missing config, it reports and lets the host decide).
    fn requires_config<R>(&self, f: impl FnOnce(&Config) -> R) -> Option<R> {
        match &self.config {
            Some(config) => Some(f(&config.lock().unwrap())),
            None => {
                send_error!(self.sender, ScratError::Validation("no configuration loaded".to_string()));
                None
            }
        }
    }

    fn requires_store<R>(&self, f: impl FnOnce(&mut MetadataStore) -> R) -> Option<R> {
        match &self.store {
            Some(store) => Some(f(&mut store.lock().unwrap())),
            None => {
                send_error!(self.sender, ScratError::Validation("no metadata catalog opened".to_string()));
                None
            }
        }
    }

    pub fn config(&self) -> Option<Config> {
        self.config.as_ref().map(|c| c.lock().unwrap().clone())
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = Some(Arc::new(Mutex::new(config)));
    }

    /// Opens (or creates) the on-disk metadata catalog this instance
    /// tracks completed backups through. Must be called before any
    /// backup/restore/rotation operation.
    pub fn open_store(&mut self, path: &std::path::Path) -> Result<(), ScratError> {
        let store = MetadataStore::open(path).map_err(ScratError::from)?;
        self.store = Some(Arc::new(Mutex::new(store)));
        Ok(())
    }

    #[cfg(test)]
    pub fn open_store_in_memory(&mut self) -> Result<(), ScratError> {
        let store = MetadataStore::open_in_memory().map_err(ScratError::from)?;
        self.store = Some(Arc::new(Mutex::new(store)));
        Ok(())
    }

    // --- config entry CRUD (§6.2/§6.4) -------------------------------------

    pub fn list_entry_keys(&self) -> Option<Vec<ConfigEntryKey>> {
        self.requires_config(|config| config.list_entry_keys())
    }

    pub fn add_entry(&self, entry_type: ConfigEntryType, name: &str) {
        if let Some(config) = &self.config {
            config.lock().unwrap().add_new_entry(&entry_type, name);
        } else {
            send_error!(self.sender, ScratError::Validation("no configuration loaded".to_string()));
        }
    }

    pub fn delete_entry(&self, key: &ConfigEntryKey) {
        if let Some(config) = &self.config {
            config.lock().unwrap().delete_entry(key);
        } else {
            send_error!(self.sender, ScratError::Validation("no configuration loaded".to_string()));
        }
    }

    // --- passwords (§6.4 `password set/delete/list`) -----------------------

    pub fn set_password(&self, id: &str, password: &SecretString) {
        let has_id = self.requires_config(|config| config.has_password_id(id));
        match has_id {
            Some(true) => {
                if let Err(err) = keyring::store_password(id, password) {
                    send_error!(self.sender, ScratError::from(err));
                }
            }
            Some(false) => {
                send_error!(
                    self.sender,
                    ScratError::Validation(format!("no destination references password id {id}"))
                );
            }
            None => {}
        }
    }

    pub fn delete_password(&self, id: &str) {
        if let Err(err) = keyring::remove_password(id) {
            send_error!(self.sender, ScratError::from(err));
        }
        self.password_cache.lock().unwrap().clear();
    }

    // --- backup / restore (§6.4 `backup_start`, `restore`) ------------------

    pub fn run_backup(&self, schedule_or_sources: &[String], destination_id: &str, kind: BackupKindRequest, passphrase: SecretString) -> Option<String> {
        let resolved = self.requires_config(|config| {
            let sources = schedule_or_sources
                .iter()
                .filter_map(|name| config.sources.get(name).cloned())
                .filter(|source| source.enabled)
                .collect::<Vec<_>>();
            let destination = config.destinations.get(destination_id).cloned();
            (sources, destination, config.backup_policy.clone())
        })?;

        let (sources, destination, policy) = resolved;
        let destination_config = destination?;
        let mut destination_handle = self.build_destination(&destination_config)?;
        if let Err(err) = destination_handle.connect() {
            send_error!(self.sender, ScratError::from(err));
            return None;
        }

        let request = BackupRequest {
            sources,
            destination_ref: destination_id.to_string(),
            kind,
            passphrase,
            policy,
        };

        let result = self.requires_store(|store| {
            backup_engine::run_backup(&self.run_state, store, &mut *destination_handle, REMOTE_ROOT, request, self.sender.clone())
        });

        let _ = destination_handle.disconnect();
        match result {
            Some(Ok(backup_id)) => Some(backup_id),
            Some(Err(err)) => {
                send_error!(self.sender, err);
                None
            }
            None => None,
        }
    }

    pub fn list_restorable_points(&self, destination_id: &str) -> Option<Vec<RestorablePoint>> {
        let points = self.requires_store(|store| restore_engine::list_restorable_points(store, destination_id));
        match points {
            Some(Ok(points)) => Some(points),
            Some(Err(err)) => {
                send_error!(self.sender, err);
                None
            }
            None => None,
        }
    }

    pub fn resolve_file_state(&self, destination_id: &str, at_timestamp: chrono::DateTime<chrono::Utc>) -> Option<Vec<FileState>> {
        let states = self.requires_store(|store| restore_engine::resolve_file_state(store, destination_id, at_timestamp));
        match states {
            Some(Ok(states)) => Some(states),
            Some(Err(err)) => {
                send_error!(self.sender, err);
                None
            }
            None => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run_restore(
        &self,
        destination_id: &str,
        at_timestamp: chrono::DateTime<chrono::Utc>,
        selection: RestoreSelection,
        target_dir: std::path::PathBuf,
        passphrase: SecretString,
    ) -> Option<RestoreStats> {
        let destination_config = self.requires_config(|config| config.destinations.get(destination_id).cloned())??;
        let mut destination_handle = self.build_destination(&destination_config)?;
        if let Err(err) = destination_handle.connect() {
            send_error!(self.sender, ScratError::from(err));
            return None;
        }

        let request = RestoreRequest {
            destination_ref: destination_id.to_string(),
            at_timestamp,
            selection,
            target_dir,
            passphrase,
        };

        let result = self.requires_store(|store| {
            restore_engine::run_restore(&self.run_state, store, &mut *destination_handle, REMOTE_ROOT, request, self.sender.clone())
        });

        let _ = destination_handle.disconnect();
        match result {
            Some(Ok(stats)) => Some(stats),
            Some(Err(err)) => {
                send_error!(self.sender, err);
                None
            }
            None => None,
        }
    }

    pub fn cancel_running_operation(&self) {
        self.run_state.request_cancel();
    }

    pub fn recent_logs(&self, backup_id: Option<&str>, limit: u32) -> Option<Vec<crate::core::metadata_store::LogEntry>> {
        let logs = self.requires_store(|store| store.recent_logs(backup_id, limit));
        match logs {
            Some(Ok(logs)) => Some(logs),
            Some(Err(err)) => {
                send_error!(self.sender, ScratError::from(err));
                None
            }
            None => None,
        }
    }

    // --- destination connectivity (§6.4 `test_destination`, SPEC_FULL §12) -

    pub fn test_destination(&self, destination_id: &str) -> Option<bool> {
        let destination_config = self.requires_config(|config| config.destinations.get(destination_id).cloned())??;
        let mut destination_handle = self.build_destination(&destination_config)?;
        match destination_handle.test() {
            Ok(()) => Some(true),
            Err(err) => {
                send_error!(self.sender, ScratError::from(err));
                Some(false)
            }
        }
    }

    // --- scheduler (§4.8, §5) ------------------------------------------------

    /// Starts the background scheduler and its job worker. The scheduler's
    /// own tick thread only decides *when* a schedule fires and enqueues a
    /// [`ScheduledJob`]; this facade's worker thread is the single
    /// consumer that actually runs backups, one at a time, so a schedule
    /// firing mid-run queues behind whatever is already in progress.
    pub fn start_scheduler(&mut self) {
        let Some(config) = self.config.clone() else {
            send_error!(self.sender, ScratError::Validation("no configuration loaded".to_string()));
            return;
        };
        if self.scheduler.is_some() {
            return;
        }

        let (job_sender, job_receiver) = unbounded();
        let mut scheduler = Scheduler::new(config.clone(), job_sender, self.sender.clone());
        scheduler.start();
        self.scheduler = Some(scheduler);

        let (worker_shutdown_tx, worker_shutdown_rx) = unbounded();
        let store = self.store.clone();
        let sender = self.sender.clone();
        let run_state = self.run_state.clone();
        let password_cache = self.password_cache.clone();
        let job_receiver_for_thread = job_receiver.clone();

        let handle = thread::spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(job_receiver_for_thread) -> job => match job {
                        Ok(job) => run_scheduled_job(job, &config, &store, &password_cache, &run_state, &sender),
                        Err(_) => break,
                    },
                    recv(worker_shutdown_rx) -> _ => break,
                }
            }
        });

        self.job_receiver = Some(job_receiver);
        self.worker_shutdown = Some(worker_shutdown_tx);
        self.worker_thread = Some(handle);
    }

    pub fn stop_scheduler(&mut self) {
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.stop();
        }
        self.scheduler = None;

        if let Some(shutdown) = self.worker_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
        self.job_receiver = None;
    }

    pub fn trigger_due_schedules_now(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.trigger_due_now();
        }
    }

    pub fn run_schedule_now(&self, schedule_id: &str) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.run_schedule_now(schedule_id);
        }
    }

    fn build_destination(&self, config: &DestinationConfig) -> Option<Box<dyn Destination>> {
        match self.build_destination_inner(config) {
            Ok(dest) => Some(dest),
            Err(err) => {
                send_error!(self.sender, err);
                None
            }
        }
    }

    fn build_destination_inner(&self, config: &DestinationConfig) -> Result<Box<dyn Destination>, ScratError> {
        let mut cache = self.password_cache.lock().unwrap();
        let dest: Box<dyn Destination> = match &config.kind {
            DestinationKind::Local(local) => Box::new(LocalDestination::new(std::path::PathBuf::from(&local.root_path))),
            DestinationKind::Sftp(sftp) => {
                let password = match &sftp.password_id {
                    Some(id) => Some(clone_secret(cache.get_password(id)?)),
                    None => None,
                };
                Box::new(SftpDestination::new(sftp.clone(), password))
            }
            DestinationKind::Smb(smb) => {
                let password = clone_secret(cache.get_password(&smb.password_id)?);
                Box::new(SmbDestination::new(smb.clone(), Some(password)))
            }
            DestinationKind::Webdav(webdav) => {
                let password = clone_secret(cache.get_password(&webdav.password_id)?);
                Box::new(WebDavDestination::new(webdav.clone(), password).map_err(ScratError::from)?)
            }
            DestinationKind::ShelledMultiCloud(shelled) => Box::new(ShelledDestination::new(shelled.clone())),
        };
        Ok(dest)
    }
}

/// `SecretString` doesn't implement `Clone`; this re-wraps an exposed copy
/// of the plaintext, needed because a cached password in [`PasswordCache`]
/// is borrowed but a destination constructor wants to own one.
fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::new(secret.expose_secret().to_string().into())
}

/// Executes one [`ScheduledJob`] end to end: resolve the schedule's
/// current sources/destination from config, connect, run the backup,
/// disconnect. Runs on the scheduler's single job worker thread, so
/// failures are narrated over the event bus rather than returned — there
/// is no caller left to hand a `Result` to.
fn run_scheduled_job(
    job: ScheduledJob,
    config: &Arc<Mutex<Config>>,
    store: &Option<Arc<Mutex<MetadataStore>>>,
    password_cache: &Arc<Mutex<PasswordCache>>,
    run_state: &Arc<RunState>,
    sender: &Sender<Arc<dyn Message>>,
) {
    let Some(store) = store else {
        send_error!(sender, ScratError::Validation("no metadata catalog opened".to_string()));
        return;
    };

    let resolved = {
        let config = config.lock().unwrap();
        let sources = job
            .sources
            .iter()
            .filter_map(|name| config.sources.get(name).cloned())
            .filter(|source| source.enabled)
            .collect::<Vec<_>>();
        let destination = config.destinations.get(&job.destination_id).cloned();
        (sources, destination, config.backup_policy.clone())
    };

    let (sources, destination, policy) = resolved;
    let Some(destination_config) = destination else {
        send_error!(
            sender,
            ScratError::Validation(format!("schedule {} references unknown destination {}", job.schedule_id, job.destination_id))
        );
        return;
    };

    // Unattended runs have no caller to prompt for a passphrase, so the
    // encryption passphrase for a scheduled destination lives in the OS
    // keyring under its own id, set ahead of time with
    // `scrat password set <destination_id>-passphrase`.
    let passphrase_id = format!("{}-passphrase", job.destination_id);
    let passphrase = {
        let mut cache = password_cache.lock().unwrap();
        match cache.get_password(&passphrase_id) {
            Ok(secret) => clone_secret(secret),
            Err(err) => {
                send_error!(sender, ScratError::from(err));
                return;
            }
        }
    };

    let mut destination_handle = match build_destination_standalone(&destination_config, password_cache) {
        Ok(dest) => dest,
        Err(err) => {
            send_error!(sender, err);
            return;
        }
    };
    if let Err(err) = destination_handle.connect() {
        send_error!(sender, ScratError::from(err));
        return;
    }

    let request = BackupRequest {
        sources,
        destination_ref: job.destination_id.clone(),
        kind: BackupKindRequest::Auto,
        passphrase,
        policy,
    };

    let mut store = store.lock().unwrap();
    if let Err(err) = backup_engine::run_backup(run_state, &mut store, &mut *destination_handle, REMOTE_ROOT, request, sender.clone()) {
        send_error!(sender, err);
    }
    let _ = destination_handle.disconnect();
}

fn build_destination_standalone(config: &DestinationConfig, password_cache: &Arc<Mutex<PasswordCache>>) -> Result<Box<dyn Destination>, ScratError> {
    let mut cache = password_cache.lock().unwrap();
    let dest: Box<dyn Destination> = match &config.kind {
        DestinationKind::Local(local) => Box::new(LocalDestination::new(std::path::PathBuf::from(&local.root_path))),
        DestinationKind::Sftp(sftp) => {
            let password = match &sftp.password_id {
                Some(id) => Some(clone_secret(cache.get_password(id)?)),
                None => None,
            };
            Box::new(SftpDestination::new(sftp.clone(), password))
        }
        DestinationKind::Smb(smb) => {
            let password = clone_secret(cache.get_password(&smb.password_id)?);
            Box::new(SmbDestination::new(smb.clone(), Some(password)))
        }
        DestinationKind::Webdav(webdav) => {
            let password = clone_secret(cache.get_password(&webdav.password_id)?);
            Box::new(WebDavDestination::new(webdav.clone(), password).map_err(ScratError::from)?)
        }
        DestinationKind::ShelledMultiCloud(shelled) => Box::new(ShelledDestination::new(shelled.clone())),
    };
    Ok(dest)
}

impl Drop for Scrat {
    fn drop(&mut self) {
        self.stop_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::{BackupPolicy, LocalDestinationConfig, Source};
    use std::collections::HashMap;

    fn test_config(dest_root: &std::path::Path) -> Config {
        let mut sources = HashMap::new();
        sources.insert(
            "docs".to_string(),
            Source {
                name: "docs".to_string(),
                root_path: "/tmp/does-not-matter".to_string(),
                enabled: true,
                exclude_patterns: vec![],
            },
        );

        let mut destinations = HashMap::new();
        destinations.insert(
            "local".to_string(),
            DestinationConfig {
                id: "local".to_string(),
                kind: DestinationKind::Local(LocalDestinationConfig {
                    root_path: dest_root.to_string_lossy().to_string(),
                }),
                enabled: true,
            },
        );

        Config {
            backup_policy: BackupPolicy::default(),
            sources,
            destinations,
            schedules: HashMap::new(),
        }
    }

    #[test]
    fn requires_config_reports_error_when_unset() {
        let (tx, rx) = unbounded();
        let scrat = Scrat::new(tx);
        assert!(scrat.list_entry_keys().is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn set_password_rejects_unknown_password_id() {
        let (tx, rx) = unbounded();
        let mut scrat = Scrat::new(tx);
        scrat.set_config(test_config(&std::env::temp_dir()));

        scrat.set_password("nobody-uses-this", &SecretString::new("hunter2".to_string().into()));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn config_roundtrips_through_set_config() {
        let (tx, _rx) = unbounded();
        let mut scrat = Scrat::new(tx);
        let config = test_config(&std::env::temp_dir());
        scrat.set_config(config);

        let keys = scrat.list_entry_keys().unwrap();
        assert_eq!(keys.len(), 2);
    }
}
