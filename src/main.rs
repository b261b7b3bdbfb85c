//! Thin CLI layer: parse args, styled output, and call into pushgate-core.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{Arg, ArgAction, Command};
use colored::Colorize;
use std::env;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use pushgate_core::package::{pack_dir, read_manifest, read_manifest_from};
use pushgate_core::store::sha256_hex;
use pushgate_core::{load_config, Config, Gallery, IdentityLedger, LedgerEntry, PackageIdentity, ValidationState};

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal() && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn warning(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.yellow());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start async runtime: {}", e))
}

/// Config from file and env, with `--data-dir` applied on top.
fn resolve_config(sub_m: &clap::ArgMatches) -> Result<Config, String> {
    let cwd = env::current_dir().map_err(|e| e.to_string())?;
    let mut config = load_config(&cwd).map_err(|e| e.to_string())?;
    if let Some(dir) = sub_m.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    Ok(config)
}

fn state_label(state: &ValidationState) -> String {
    let name = state.name();
    if !use_color() {
        return name.to_string();
    }
    match state {
        ValidationState::Available => name.green().to_string(),
        ValidationState::Pending => name.yellow().to_string(),
        ValidationState::Rejected { .. } => name.red().to_string(),
    }
}

fn print_entry(entry: &LedgerEntry) {
    let identity = &entry.claim.identity;
    println!(
        "{} {}  {}",
        identity.id(),
        identity.version(),
        state_label(&entry.state)
    );
    if let ValidationState::Rejected { reason } = &entry.state {
        dim(&format!("  reason: {}", reason));
    }
}

fn open_ledger(config: &Config) -> Result<IdentityLedger, String> {
    let rt = runtime()?;
    rt.block_on(IdentityLedger::open(config.data_dir.join("ledger")))
        .map_err(|e| e.to_string())
}

fn cmd_serve(sub_m: &clap::ArgMatches) -> Result<(), String> {
    let mut config = resolve_config(sub_m)?;
    if let Some(bind) = sub_m.get_one::<String>("bind") {
        config.bind = bind.clone();
    }
    if let Some(workers) = sub_m.get_one::<usize>("workers") {
        config.workers = *workers;
    }
    config.validate().map_err(|e| e.to_string())?;

    info(&format!(
        "Serving {} on {} ({} validation workers)",
        config.data_dir.display(),
        config.bind,
        config.workers
    ));
    if config.api_keys.is_empty() {
        warning("No API keys configured: anyone can push.");
    }

    let rt = runtime()?;
    rt.block_on(async move {
        let gallery = std::sync::Arc::new(Gallery::open(config).await?);
        pushgate_core::server::serve(gallery).await
    })
    .map_err(|e| e.to_string())
}

#[cfg(feature = "http-reqwest")]
fn cmd_push(sub_m: &clap::ArgMatches) -> Result<(), String> {
    use indicatif::{ProgressBar, ProgressStyle};
    use pushgate_core::client::{PublishClient, PushOutcome};
    use std::time::Duration;

    let file = sub_m
        .get_one::<String>("file")
        .ok_or("Missing package file")?;
    let content = fs::read(file).map_err(|e| format!("{}: {}", file, e))?;
    let identity = read_manifest_from(&content[..])
        .and_then(|m| m.identity())
        .map_err(|e| e.to_string())?;
    let url = sub_m
        .get_one::<String>("url")
        .cloned()
        .or_else(|| env::var("PUSHGATE_URL").ok())
        .unwrap_or_else(|| format!("http://{}", pushgate_core::config::DEFAULT_BIND));
    let api_key = sub_m
        .get_one::<String>("api-key")
        .cloned()
        .or_else(|| env::var("PUSHGATE_API_KEY").ok());

    let client = PublishClient::new(&url, api_key).map_err(|e| e.to_string())?;
    let rt = runtime()?;
    info(&format!("Pushing {} to {} …", identity, url));

    let outcome = rt
        .block_on(client.push(content, Some(&identity)))
        .map_err(|e| e.to_string())?;
    match outcome {
        PushOutcome::Created(receipt) => {
            success(&format!("Created {} {}", receipt.id, receipt.version));
            dim(&format!("  sha256: {}", receipt.sha256));
            dim(&format!("  {} bytes, {}", receipt.size, receipt.state));
        }
        PushOutcome::Conflict(message) => {
            return Err(format!("Conflict: {}", message));
        }
        PushOutcome::Failed { status, code, message } => {
            return Err(format!("Push failed ({} {}): {}", status, code, message));
        }
    }

    if !sub_m.get_flag("wait") {
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹")
        .template("{spinner:.dim} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(format!("Waiting for validation of {} …", identity));
    spinner.enable_steady_tick(Duration::from_millis(80));

    let report = rt.block_on(async {
        for _ in 0..240 {
            match client.status(&identity).await {
                Ok(Some(report)) if report.state != "pending" => return Ok(Some(report)),
                Ok(_) => tokio::time::sleep(Duration::from_millis(500)).await,
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(None)
    });
    spinner.finish_and_clear();

    match report? {
        Some(report) if report.state == "available" => {
            success(&format!("{} is available", identity));
            Ok(())
        }
        Some(report) => Err(format!(
            "{} was rejected: {}",
            identity,
            report.reason.unwrap_or_default()
        )),
        None => Err(format!("{} is still pending; check `pushgate status` later", identity)),
    }
}

#[cfg(not(feature = "http-reqwest"))]
fn cmd_push(_sub_m: &clap::ArgMatches) -> Result<(), String> {
    Err("pushgate was built without the http-reqwest feature; push is unavailable".to_string())
}

fn cmd_status(sub_m: &clap::ArgMatches) -> Result<(), String> {
    let config = resolve_config(sub_m)?;
    let id = sub_m.get_one::<String>("id").ok_or("Missing package id")?;
    let version = sub_m.get_one::<String>("version").ok_or("Missing version")?;
    let identity = PackageIdentity::parse(id, version).map_err(|e| e.to_string())?;

    let ledger = open_ledger(&config)?;
    match ledger.entry(&identity) {
        Some(entry) => {
            print_entry(&entry);
            dim(&format!("  claimed: {}", entry.claim.claimed_at.to_rfc3339()));
            if let Some(artifact) = &entry.artifact {
                dim(&format!("  sha256: {}", artifact.sha256));
                dim(&format!("  size: {} bytes", artifact.size));
            }
            Ok(())
        }
        None => Err(format!("{} has never been published", identity)),
    }
}

fn cmd_list(sub_m: &clap::ArgMatches) -> Result<(), String> {
    let config = resolve_config(sub_m)?;
    let ledger = open_ledger(&config)?;
    let entries = ledger.list();
    if entries.is_empty() {
        info("No packages published yet.");
        return Ok(());
    }
    for entry in &entries {
        print_entry(entry);
    }
    dim(&format!("\n{} claim(s)", entries.len()));
    Ok(())
}

fn cmd_inspect(sub_m: &clap::ArgMatches) -> Result<(), String> {
    let file = sub_m
        .get_one::<String>("file")
        .ok_or("Missing package file")?;
    let path = Path::new(file);
    let manifest = read_manifest(path).map_err(|e| e.to_string())?;
    let identity = manifest.identity().map_err(|e| e.to_string())?;
    let content = fs::read(path).map_err(|e| e.to_string())?;

    println!("{} {}", identity.id(), identity.version());
    if let Some(description) = &manifest.description {
        dim(&format!("  description: {}", description));
    }
    if let Some(license) = &manifest.license {
        dim(&format!("  license: {}", license));
    }
    if !manifest.authors.is_empty() {
        dim(&format!("  authors: {}", manifest.authors.join(", ")));
    }
    dim(&format!("  sha256: {}", sha256_hex(&content)));
    dim(&format!("  size: {} bytes", content.len()));
    Ok(())
}

fn cmd_pack(sub_m: &clap::ArgMatches) -> Result<(), String> {
    let dir = sub_m.get_one::<String>("dir").ok_or("Missing package directory")?;
    let archive = pack_dir(Path::new(dir)).map_err(|e| e.to_string())?;
    let identity = read_manifest_from(&archive[..])
        .and_then(|m| m.identity())
        .map_err(|e| e.to_string())?;
    let out = sub_m
        .get_one::<String>("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.tgz", identity.file_stem())));
    fs::write(&out, &archive).map_err(|e| format!("{}: {}", out.display(), e))?;
    success(&format!("Packed {} into {}", identity, out.display()));
    Ok(())
}

fn run() -> Result<(), String> {
    let data_dir_arg = Arg::new("data-dir")
        .long("data-dir")
        .value_name("DIR")
        .help("Data directory (default: from pushgate.json, PUSHGATE_DATA_DIR, or the platform data dir)");

    let matches = Command::new("pushgate")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Bhuvan Prakash <bhuvanstark6@gmail.com>")
        .about("First-writer-wins package gallery: claim, store, validate, serve")
        .after_help(
            "Examples:\n  pushgate serve --bind 0.0.0.0:5080\n  pushgate pack ./my-lib\n  pushgate push my-lib.1.0.0.tgz --wait\n  pushgate status my-lib 1.0.0\n  pushgate list",
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging (RUST_LOG overrides)"),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the gallery HTTP server")
                .arg(Arg::new("bind").long("bind").value_name("ADDR").help("Listen address"))
                .arg(data_dir_arg.clone())
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .help("Validation workers (default: number of CPUs)"),
                ),
        )
        .subcommand(
            Command::new("push")
                .about("Publish a package archive to a running server")
                .arg(Arg::new("file").required(true).help("Package archive (.tgz)"))
                .arg(
                    Arg::new("url")
                        .long("url")
                        .value_name("URL")
                        .help("Server URL (or set PUSHGATE_URL)"),
                )
                .arg(
                    Arg::new("api-key")
                        .long("api-key")
                        .value_name("KEY")
                        .help("API key (or set PUSHGATE_API_KEY)"),
                )
                .arg(
                    Arg::new("wait")
                        .long("wait")
                        .action(ArgAction::SetTrue)
                        .help("Wait until validation finishes"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show the ledger state of one package version")
                .arg(Arg::new("id").required(true).help("Package id"))
                .arg(Arg::new("version").required(true).help("Package version"))
                .arg(data_dir_arg.clone()),
        )
        .subcommand(
            Command::new("list")
                .about("List every claimed package version")
                .arg(data_dir_arg),
        )
        .subcommand(
            Command::new("inspect")
                .about("Show the identity and digest of a package archive")
                .arg(Arg::new("file").required(true).help("Package archive (.tgz)")),
        )
        .subcommand(
            Command::new("pack")
                .about("Build a package archive from a directory with package.json")
                .arg(Arg::new("dir").required(true).help("Package directory"))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Output file (default: <id>.<version>.tgz)"),
                ),
        )
        .get_matches();

    pushgate_core::telemetry::init_tracing(matches.get_flag("verbose"));

    match matches.subcommand() {
        Some(("serve", sub_m)) => cmd_serve(sub_m),
        Some(("push", sub_m)) => cmd_push(sub_m),
        Some(("status", sub_m)) => cmd_status(sub_m),
        Some(("list", sub_m)) => cmd_list(sub_m),
        Some(("inspect", sub_m)) => cmd_inspect(sub_m),
        Some(("pack", sub_m)) => cmd_pack(sub_m),
        _ => {
            if use_color() {
                println!("{}", "pushgate: first-writer-wins package gallery".bold());
            } else {
                println!("pushgate: first-writer-wins package gallery");
            }
            dim("\nRun `pushgate --help` for details.");
            Ok(())
        }
    }
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
