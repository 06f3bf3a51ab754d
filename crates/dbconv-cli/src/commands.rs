use crate::Command;
use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use dbconv_core::{custom_id, display_name, ConversionConfig, DatabaseRecord, ProgressEvent, SourceKind};
use dbconv_engine::{ConversionHandle, ConversionManager};
use dbconv_env::probe_tool;
use std::path::PathBuf;
use tracing::warn;

#[derive(Args, Debug)]
pub(crate) struct ConvertArgs {
    /// Catalog name, or the id to store an explicit --source under
    #[arg(required_unless_present = "custom", conflicts_with = "custom")]
    pub name: Option<String>,
    /// Source BLAST database path (defaults to the catalog entry's path)
    #[arg(long)]
    pub source: Option<PathBuf>,
    /// Treat the source as a user-supplied database; its id is
    /// `custom_<source file name>`
    #[arg(long, default_value_t = false)]
    pub custom: bool,
}

#[derive(Args, Debug)]
pub(crate) struct StatusArgs {
    pub id: Option<String>,
    /// Print records as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub(crate) async fn run(manager: &ConversionManager, command: Command) -> Result<()> {
    match command {
        Command::Convert(args) => convert(manager, args).await,
        Command::Status(args) => status(manager, args),
        Command::Ready => {
            let ready = manager.ready();
            if ready.is_empty() {
                println!("No converted databases.");
            }
            for record in &ready {
                print_record(record, false);
            }
            Ok(())
        }
        Command::Retry { id } => {
            let handle = manager
                .retry(&id)
                .with_context(|| format!("cannot retry {id}"))?;
            follow(manager, handle).await
        }
        Command::Cleanup { id } => {
            if manager.cleanup(&id).await? {
                println!("{id}: removed converted files and reset status");
            } else {
                println!("{id}: nothing to clean up");
            }
            Ok(())
        }
        Command::Reconcile => {
            let report = manager.reconcile()?;
            for id in &report.interrupted {
                println!("{id}: interrupted conversion marked failed");
            }
            for id in &report.repaired_paths {
                println!("{id}: converted path repaired");
            }
            if report.is_empty() {
                println!("Status file is consistent.");
            }
            Ok(())
        }
        Command::Doctor => doctor(manager).await,
    }
}

/// Resolves `(id, source, kind)` from the arguments and the configured catalog.
pub(crate) fn resolve_target(
    config: &ConversionConfig,
    args: &ConvertArgs,
) -> Result<(String, PathBuf, SourceKind)> {
    if args.custom {
        let source = args
            .source
            .clone()
            .ok_or_else(|| anyhow!("--source is required for custom databases"))?;
        return Ok((custom_id(&source), source, SourceKind::Custom));
    }
    let name = args
        .name
        .as_deref()
        .map(str::trim)
        .ok_or_else(|| anyhow!("a database name is required without --custom"))?;
    let entry = config.catalog_entry(name);
    let source = match (&args.source, entry) {
        (Some(source), _) => source.clone(),
        (None, Some(entry)) => entry.source_path.clone(),
        (None, None) => bail!("{name} is not in the catalog; pass --source <path>"),
    };
    let id = entry.map(|entry| entry.id()).unwrap_or_else(|| name.to_string());
    Ok((id, source, SourceKind::Catalog))
}

async fn convert(manager: &ConversionManager, args: ConvertArgs) -> Result<()> {
    let (id, source, kind) = resolve_target(manager.config(), &args)?;
    let handle = manager.ensure_converted(&id, &source, kind)?;
    follow(manager, handle).await
}

/// Streams progress until the run ends. Ctrl-C cancels it.
async fn follow(manager: &ConversionManager, mut handle: ConversionHandle) -> Result<()> {
    let id = handle.id().to_string();
    let mut interruptible = true;
    if !handle.cached() {
        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(event) => print_event(&event),
                    None => break,
                },
                signal = tokio::signal::ctrl_c(), if interruptible => {
                    if let Err(err) = signal {
                        warn!(error = %err, "cannot listen for ctrl-c");
                        interruptible = false;
                        continue;
                    }
                    if manager.cancel(&id) {
                        eprintln!("Cancelling {}...", display_name(&id));
                    }
                }
            }
        }
    }
    match handle.wait().await {
        Ok(path) => {
            println!("{id}: ready at {}", path.display());
            Ok(())
        }
        Err(failure) => bail!("{id}: {} ({})", failure.message, failure.reason),
    }
}

fn status(manager: &ConversionManager, args: StatusArgs) -> Result<()> {
    let records = match &args.id {
        Some(id) => vec![manager.status(id)],
        None => manager.statuses(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No databases tracked.");
    }
    for record in &records {
        print_record(record, manager.is_converting(&record.id));
    }
    Ok(())
}

async fn doctor(manager: &ConversionManager) -> Result<()> {
    let env = manager.environment();
    let config = manager.config();
    let available = env.available().await;
    println!("environment: {} ({})", env.name(), if available { "available" } else { "unavailable" });
    if !available {
        bail!("{} execution environment is not available", env.name());
    }

    let mut missing = Vec::new();
    for tool in [&config.extractor, &config.builder] {
        let report = probe_tool(env.as_ref(), tool).await;
        match (&report.location, &report.version) {
            (Some(location), Some(version)) => println!("{tool}: {location} ({version})"),
            (Some(location), None) => println!("{tool}: {location} (version unknown)"),
            (None, _) => {
                println!("{tool}: not found");
                missing.push(tool.clone());
            }
        }
    }

    match env.translate_path(&config.target_root) {
        Ok(root) => match env.free_bytes(&root).await {
            Ok(free) => println!(
                "free space at {}: {:.2} GB (minimum {:.2} GB)",
                config.target_root.display(),
                free as f64 / 1_073_741_824.0,
                config.min_free_bytes as f64 / 1_073_741_824.0
            ),
            Err(err) => println!("free space at {}: unknown ({err})", config.target_root.display()),
        },
        Err(err) => println!("target root: {err}"),
    }

    if !missing.is_empty() {
        bail!("missing tools: {}", missing.join(", "));
    }
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    println!(
        "[{:>3}%] {:<10} {}",
        event.percent,
        event.stage.as_str(),
        event.message
    );
}

fn print_record(record: &DatabaseRecord, running: bool) {
    let detail = match (&record.converted_path, &record.error) {
        (Some(path), _) => path.display().to_string(),
        (None, Some(error)) => error.clone(),
        (None, None) if running => "(running)".to_string(),
        (None, None) => String::new(),
    };
    println!("{:<24} {:<14} {}", record.id, record.status.as_str(), detail);
}
