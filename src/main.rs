use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rbd_backup::config::Config;
use rbd_backup::constants::naming;
use rbd_backup::operations::{backup, restore};
use rbd_backup::services::guest::GuestClient;
use rbd_backup::services::rbd::RbdClient;
use rbd_backup::types::{parse_stamp, BackupTarget, ExportKind};

const DEFAULT_CONFIG: &str = "/etc/rbd-backup.toml";

#[derive(Debug)]
enum Mode {
    Backup(ExportKind),
    Restore(String),
}

#[derive(Debug)]
struct Args {
    config_path: String,
    mode: Mode,
    /// Instance names or ids narrowing the run; empty means all targets.
    selectors: Vec<String>,
}

fn usage() -> String {
    [
        "Usage: rbd-backup [-c CONFIG] (-b full|inc | -r DATE) [-i NAME_OR_ID ...]",
        "  -c CONFIG   config file (default: /etc/rbd-backup.toml)",
        "  -b TYPE     run a backup round: full or inc",
        "  -r DATE     restore a single instance inplace to DATE",
        "  -i TARGET   limit the run to the given instances (names or ids)",
    ]
    .join("\n")
}

fn parse_args(argv: &[String]) -> Result<Args> {
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut mode = None;
    let mut selectors = Vec::new();

    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config_path = iter
                    .next()
                    .ok_or_else(|| anyhow!("-c requires a path\n{}", usage()))?
                    .clone();
            }
            "-b" => {
                let kind = match iter.next().map(String::as_str) {
                    Some("full") => ExportKind::Full,
                    Some("inc") => ExportKind::Incremental,
                    other => bail!("-b requires 'full' or 'inc', got {:?}\n{}", other, usage()),
                };
                if mode.is_some() {
                    bail!("-b and -r are mutually exclusive\n{}", usage());
                }
                mode = Some(Mode::Backup(kind));
            }
            "-r" => {
                let date = iter
                    .next()
                    .ok_or_else(|| anyhow!("-r requires a date\n{}", usage()))?;
                if mode.is_some() {
                    bail!("-b and -r are mutually exclusive\n{}", usage());
                }
                mode = Some(Mode::Restore(normalize_restore_date(date)?));
            }
            "-i" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("-i requires a value\n{}", usage()))?;
                selectors.extend(value.split(',').map(|s| s.trim().to_string()));
            }
            other => bail!("Unknown argument {}\n{}", other, usage()),
        }
    }

    let mode = mode.ok_or_else(|| anyhow!("No action specified (choose -b or -r)\n{}", usage()))?;
    Ok(Args {
        config_path,
        mode,
        selectors,
    })
}

/// Accept the canonical timestamp or the operator-facing
/// `DD-MM-YYYY HH:MM` form, normalized to the canonical one.
fn normalize_restore_date(date: &str) -> Result<String> {
    if parse_stamp(date).is_some() {
        return Ok(date.to_string());
    }
    if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(date, naming::USER_TIME_FORMAT) {
        return Ok(parsed.format(naming::TIME_FORMAT).to_string());
    }
    bail!(
        "Restore date '{}' matches neither {} nor {}",
        date,
        naming::TIME_FORMAT,
        naming::USER_TIME_FORMAT
    )
}

/// The backup root must accept writes before anything is snapshotted;
/// finding out mid-round would leave half a round behind.
async fn check_backup_root_writable(root: &Path) -> Result<()> {
    let probe = root.join(".write_probe");
    tokio::fs::write(&probe, b"test").await.with_context(|| {
        format!(
            "{} is not writeable. Check free space or permissions!",
            root.display()
        )
    })?;
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}

fn select_targets(targets: Vec<BackupTarget>, selectors: &[String]) -> Vec<BackupTarget> {
    if selectors.is_empty() {
        return targets;
    }
    let matches = |t: &BackupTarget, sel: &str| {
        t.name == sel || t.folder.ends_with(&format!("_{}", sel))
    };
    let selected: Vec<BackupTarget> = targets
        .into_iter()
        .filter(|t| selectors.iter().any(|sel| matches(t, sel)))
        .collect();
    for sel in selectors {
        if !selected.iter().any(|t| matches(t, sel)) {
            warn!("Cannot find a configured target matching {}", sel);
        }
    }
    selected
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env().add_directive("rbd_backup=info".parse()?);
    fmt().with_env_filter(env_filter).init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;
    info!("rbd-backup starting (config: {})", args.config_path);

    let config = Config::load(&args.config_path).await?;
    let backup_root = Path::new(&config.backup.root_dir).to_path_buf();
    check_backup_root_writable(&backup_root).await?;

    let rbd = RbdClient::new(&config.cluster);
    let guest = GuestClient::new(&config.guest);

    let targets = select_targets(config.backup_targets(), &args.selectors);
    if targets.is_empty() {
        warn!("Nothing to do: no targets selected");
    }

    // Coarse cancellation: an operator interrupt finishes the current
    // target, so thaw/power-on compensations still run, and stops before
    // the next one.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing the current target before exiting");
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let run_result = match &args.mode {
        Mode::Backup(kind) => {
            let mut total_failures = 0u32;
            for target in &targets {
                if interrupted.load(Ordering::SeqCst) {
                    warn!("Stopping before {} due to interrupt", target.name);
                    break;
                }
                match backup::backup_target(
                    &rbd,
                    &guest,
                    &backup_root,
                    target,
                    *kind,
                    config.backup.retention_weeks,
                )
                .await
                {
                    Ok(failures) => total_failures += failures,
                    Err(e) => {
                        error!("Backup round for {} failed: {:#}", target.name, e);
                        total_failures += 1;
                    }
                }
            }
            if total_failures > 0 {
                warn!("{} image backup(s) failed this run", total_failures);
            }
            Ok(())
        }
        Mode::Restore(date) => {
            if targets.len() != 1 {
                bail!(
                    "Exactly one instance must be selected for restore, got {}",
                    targets.len()
                );
            }
            restore::restore_target_inplace(&rbd, &guest, &backup_root, &targets[0], date).await
        }
    };

    // Stale `.bak` placeholders are swept on every invocation, whatever
    // the mode or outcome.
    restore::sweep_stale_bak_images(&rbd).await;

    run_result
}
