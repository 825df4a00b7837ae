use anyhow::{anyhow, Result};
use clap::Parser;
use osmigrate_archive::{delete_archive, list_archives, prune_older_than, verify_archive};
use osmigrate_core::{
    EngineConfig, HostFamily, MigrationRequest, MigrationStage, PlatformBackend, SystemToolRunner,
    ToolRunner,
};
use osmigrate_host_posix::PosixBackend;
use osmigrate_host_windows::WindowsBackend;
use osmigrate_identify::Classifier;
use osmigrate_imaging::{scan_directory, validate_image};
use osmigrate_safety::{
    check_destructive, issue_confirmation_token, DestructiveOp, SafetyContext, SafetyDecision,
};
use osmigrate_workflow_engine::MigrationOrchestrator;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod cli;
mod logger;

use cli::{BackupCommands, BootCommands, Cli, Commands, Confirmation, PartitionCommands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(&cli.log_level)?;
    let config = EngineConfig::resolve(cli.config.as_deref())?;
    let pretty = cli.pretty;

    match cli.command {
        Commands::ValidateImage { path } => print_json(&validate_image(&path)?, pretty),
        Commands::Scan { directory } => print_json(&scan_directory(&directory), pretty),
        Commands::Identify { root } => {
            let os = Classifier::builtin()?.classify(&root)?;
            print_json(&os, pretty)
        }
        Commands::Prepare { image } => {
            let orchestrator = MigrationOrchestrator::new(build_backend(&config)?, config.clone());
            print_json(&orchestrator.prepare_target_os(&image)?, pretty)
        }
        Commands::Migrate {
            image,
            target,
            preserve_data,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::Migrate)?;
            run_migration(&config, MigrationRequest::new(image, target, preserve_data), pretty)
        }
        Commands::Partitions { action } => run_partitions(&config, action, pretty),
        Commands::Backup { action } => run_backup(&config, action, pretty),
        Commands::Boot { action } => run_boot(&config, action, pretty),
    }
}

fn run_migration(config: &EngineConfig, request: MigrationRequest, pretty: bool) -> Result<()> {
    let orchestrator = MigrationOrchestrator::new(build_backend(config)?, config.clone());
    let observer = |stage: MigrationStage, percent: u8, message: &str| {
        eprintln!("[{:>3}%] {} ({})", percent, message, stage.as_str());
        true
    };
    match orchestrator.execute_with_observer(&request, &observer) {
        Ok(success) => print_json(&success, pretty),
        Err(failure) => {
            print_json(
                &serde_json::json!({
                    "success": false,
                    "stage": failure.stage,
                    "error": failure.message,
                    "kind": failure.cause.kind().to_string(),
                    "cause": failure.cause.to_string(),
                }),
                pretty,
            )?;
            Err(failure.into())
        }
    }
}

fn run_partitions(config: &EngineConfig, action: PartitionCommands, pretty: bool) -> Result<()> {
    let backend = build_backend(config)?;
    let partitions = backend.partitions();
    let outcome = match action {
        PartitionCommands::List => return print_json(&partitions.list()?, pretty),
        PartitionCommands::Info { id } => return print_json(&partitions.info(&id)?, pretty),
        PartitionCommands::Create {
            disk,
            size,
            fs,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::PartitionCreate)?;
            partitions.create(&disk, size.as_deref(), &fs)
        }
        PartitionCommands::Delete { id, confirmation } => {
            authorize(&confirmation, DestructiveOp::PartitionDelete)?;
            partitions.delete(&id)
        }
        PartitionCommands::Resize {
            id,
            size,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::PartitionResize)?;
            partitions.resize(&id, &size)
        }
        PartitionCommands::Format {
            id,
            fs,
            label,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::PartitionFormat)?;
            partitions.format(&id, &fs, label.as_deref())
        }
    };
    // Failed operations are still recorded; show the record either way.
    print_json(&partitions.operation_log(), pretty)?;
    outcome?;
    Ok(())
}

fn run_backup(config: &EngineConfig, action: BackupCommands, pretty: bool) -> Result<()> {
    let backup_dir = |dir: Option<PathBuf>| dir.unwrap_or_else(|| config.backup_dir.clone());
    match action {
        BackupCommands::Create { dest } => {
            let record = build_backend(config)?.create_archive(&backup_dir(dest))?;
            print_json(&record, pretty)
        }
        BackupCommands::Restore {
            archive,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::Restore)?;
            print_json(&build_backend(config)?.restore_archive(&archive)?, pretty)
        }
        BackupCommands::RestoreLatest { dir, confirmation } => {
            authorize(&confirmation, DestructiveOp::Restore)?;
            print_json(&build_backend(config)?.restore_latest(&backup_dir(dir))?, pretty)
        }
        BackupCommands::List { dir } => print_json(&list_archives(backup_dir(dir))?, pretty),
        BackupCommands::Verify { archive } => print_json(&verify_archive(&archive)?, pretty),
        BackupCommands::Delete {
            archive,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::BackupDelete)?;
            delete_archive(&archive)?;
            info!(archive = %archive.display(), "backup deleted");
            Ok(())
        }
        BackupCommands::Prune {
            dir,
            days,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::BackupPrune)?;
            let days = days.unwrap_or(config.retention_days);
            let report = prune_older_than(backup_dir(dir), days)?;
            print_json(&report, pretty)
        }
    }
}

fn run_boot(config: &EngineConfig, action: BootCommands, pretty: bool) -> Result<()> {
    let backend = build_backend(config)?;
    let bootloader = backend.bootloader();
    match action {
        BootCommands::List => print_json(&bootloader.list_entries()?, pretty),
        BootCommands::SetDefault { entry } => print_json(&bootloader.set_default(&entry)?, pretty),
        BootCommands::Remove {
            entry,
            confirmation,
        } => {
            authorize(&confirmation, DestructiveOp::BootRemove)?;
            print_json(&bootloader.remove_entry(&entry)?, pretty)
        }
    }
}

/// One backend per process, chosen from the host family.
fn build_backend(config: &EngineConfig) -> Result<Arc<dyn PlatformBackend>> {
    let runner: Arc<dyn ToolRunner> = Arc::new(SystemToolRunner::new(config.tool_timeout()));
    let backend: Arc<dyn PlatformBackend> = match HostFamily::detect() {
        HostFamily::Windows => Arc::new(WindowsBackend::new(config, runner)?),
        HostFamily::Posix => Arc::new(PosixBackend::new(config, runner)?),
    };
    info!(family = backend.family().as_str(), "platform backend selected");
    Ok(backend)
}

fn authorize(confirmation: &Confirmation, op: DestructiveOp) -> Result<()> {
    let ctx = SafetyContext {
        force_mode: confirmation.force,
        confirmation_token: confirmation.confirm.clone(),
    };
    match check_destructive(&ctx, op) {
        SafetyDecision::Allow => Ok(()),
        SafetyDecision::Deny(reason) => {
            eprintln!("{}", reason);
            eprintln!(
                "Re-run with: --force --confirm {}",
                issue_confirmation_token(op)
            );
            Err(anyhow!(reason))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
