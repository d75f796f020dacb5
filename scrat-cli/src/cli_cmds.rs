use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "scrat", version = "1.0", about = "Scrat - an encrypted, scheduled backup tool")]
pub struct Cli {
    #[command(subcommand)]
    pub command: MainCommands,
}

#[derive(Subcommand)]
pub enum MainCommands {
    /// Run a backup now.
    Backup {
        /// Names of the source profiles to include.
        sources: Vec<String>,

        /// The destination id to back up to.
        #[arg(long)]
        destination: String,

        /// Force a full backup instead of the automatically-resolved kind.
        #[arg(long, action = ArgAction::SetTrue)]
        full: bool,

        /// Force an incremental backup instead of the automatically-resolved kind.
        #[arg(long, action = ArgAction::SetTrue, conflicts_with = "full")]
        incremental: bool,
    },
    /// Cancel whatever backup or restore is currently running.
    Cancel,
    /// List the points in time a destination can be restored to.
    ListRestorable {
        /// The destination id.
        destination: String,
    },
    /// Show what a destination's file tree looked like at a point in time.
    ListFiles {
        /// The destination id.
        destination: String,

        /// RFC 3339 timestamp to resolve file state at.
        #[arg(long)]
        at: String,
    },
    /// Restore a destination's tree as of a point in time.
    Restore {
        /// The destination id.
        destination: String,

        /// RFC 3339 timestamp to restore from.
        #[arg(long)]
        at: String,

        /// Directory to restore into.
        #[arg(long)]
        target: std::path::PathBuf,

        /// Restore only these relative paths instead of everything.
        #[arg(long)]
        paths: Vec<String>,
    },
    /// Check a destination can be reached (connect, stat, disconnect).
    TestDestination {
        /// The destination id.
        destination: String,
    },
    /// Show recent entries from the backup log ring buffer.
    Log {
        /// Restrict to one backup id.
        #[arg(long)]
        backup: Option<String>,

        /// Maximum number of entries to show.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Manage the background scheduler.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Manage passwords stored in the OS keyring.
    Password {
        #[command(subcommand)]
        command: PasswordCommands,
    },
    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Start the background scheduler for this process's lifetime.
    Start,
    /// Stop the background scheduler.
    Stop,
    /// Run every schedule that's currently due, right now.
    TriggerDue,
    /// Run one schedule immediately, independent of its cron expression.
    RunNow {
        /// The schedule id.
        schedule: String,
    },
}

#[derive(Subcommand)]
pub enum PasswordCommands {
    /// Sets a password.
    Set {
        /// The password id.
        id: String,
    },
    /// Deletes a password.
    Delete {
        /// The password id.
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// List configured sources, destinations, and schedules.
    List,
    /// Add a blank entry of the given type under the given name.
    Add {
        /// One of "source", "destination", "schedule".
        entry_type: String,
        /// The entry's name.
        name: String,
    },
    /// Delete an entry.
    Delete {
        /// One of "source", "destination", "schedule".
        entry_type: String,
        /// The entry's name.
        name: String,
    },
    /// Print or write the example config.
    Example {
        #[command(subcommand)]
        command: ConfigExampleCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigExampleCommands {
    /// Show config example.
    Show,
    /// Write config example to scrat.toml.
    Write,
}
