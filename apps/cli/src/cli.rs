//! Command-line definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Operating-system migration engine
#[derive(Parser)]
#[command(name = "osmigrate")]
#[command(about = "Validate, back up, install and boot a replacement operating system", long_about = None)]
#[command(version)]
pub struct Cli {
    /// JSON engine configuration (defaults apply when omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Opt-in for commands that destroy or overwrite data.
#[derive(Args, Debug, Clone)]
pub struct Confirmation {
    /// Allow a destructive operation
    #[arg(long)]
    pub force: bool,

    /// Token printed by a previous refused attempt
    #[arg(long)]
    pub confirm: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that a file looks like an installable image
    ValidateImage { path: PathBuf },

    /// List image files under a directory with sizes and checksums
    Scan { directory: PathBuf },

    /// Classify an extracted or already mounted image tree
    Identify { root: PathBuf },

    /// Validate, mount and classify an image without installing it
    Prepare { image: PathBuf },

    /// Run the full migration pipeline
    Migrate {
        image: PathBuf,

        /// Partition that receives the new system
        #[arg(long)]
        target: String,

        /// Back up the current system before touching the target
        #[arg(long)]
        preserve_data: bool,

        #[command(flatten)]
        confirmation: Confirmation,
    },

    /// Partition inspection and editing
    Partitions {
        #[command(subcommand)]
        action: PartitionCommands,
    },

    /// System backups
    Backup {
        #[command(subcommand)]
        action: BackupCommands,
    },

    /// Boot menu entries
    Boot {
        #[command(subcommand)]
        action: BootCommands,
    },
}

#[derive(Subcommand)]
pub enum PartitionCommands {
    List,

    Info { id: String },

    Create {
        /// Disk device (POSIX) or disk number (Windows)
        disk: String,

        /// Size of the new partition; the rest of the disk when omitted
        #[arg(long)]
        size: Option<String>,

        #[arg(long)]
        fs: String,

        #[command(flatten)]
        confirmation: Confirmation,
    },

    Delete {
        id: String,

        #[command(flatten)]
        confirmation: Confirmation,
    },

    Resize {
        id: String,

        #[arg(long)]
        size: String,

        #[command(flatten)]
        confirmation: Confirmation,
    },

    Format {
        id: String,

        #[arg(long)]
        fs: String,

        #[arg(long)]
        label: Option<String>,

        #[command(flatten)]
        confirmation: Confirmation,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Archive the current system and print its backup record
    Create {
        /// Destination directory (configured backup_dir by default)
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Restore the system from an archive
    Restore {
        archive: PathBuf,

        #[command(flatten)]
        confirmation: Confirmation,
    },

    /// Restore the newest archive in a directory
    RestoreLatest {
        #[arg(long)]
        dir: Option<PathBuf>,

        #[command(flatten)]
        confirmation: Confirmation,
    },

    /// List archives on disk, newest first
    ///
    /// Backup records (id, status, file counts) live only for the process that created
    /// them and are printed by `backup create`; this command reads the archives themselves.
    List {
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    Verify { archive: PathBuf },

    Delete {
        archive: PathBuf,

        #[command(flatten)]
        confirmation: Confirmation,
    },

    /// Delete archives older than the retention period
    Prune {
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Age in days (configured retention_days by default)
        #[arg(long)]
        days: Option<u32>,

        #[command(flatten)]
        confirmation: Confirmation,
    },
}

#[derive(Subcommand)]
pub enum BootCommands {
    List,

    SetDefault { entry: String },

    Remove {
        entry: String,

        #[command(flatten)]
        confirmation: Confirmation,
    },
}
