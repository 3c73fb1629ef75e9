mod logging;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use vibebox_core::cancel::CancelToken;
use vibebox_core::progress::{ProgressEvent, ProgressFn, noop_progress};
use vibebox_core::request::ExecRequest;
use vibebox_runtime::StartIo;
use vibebox_runtime::bridge::{ExecBridge, ProbeBridge};
use vibebox_runtime::service::{InitializeRequest, SandboxService};

#[derive(Parser)]
#[command(
    name = "vibebox",
    version,
    about = "Run untrusted commands in an isolated sandbox (off, docker, or apple-vm)"
)]
struct Cli {
    /// Emit a single JSON object on stdout (agent bridge mode).
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an official image and write .vibebox/config.yaml
    Init {
        /// Catalog image id
        #[arg(long, default_value = "ubuntu-24.04")]
        image: String,
        /// Provider to record in the config
        #[arg(long, default_value = "auto")]
        provider: String,
    },
    /// Probe all backends and report the selection
    Probe {
        #[arg(default_value = "auto")]
        provider: String,
    },
    /// Execute one command in the sandbox
    Exec {
        command: String,
        /// Override the configured provider
        #[arg(long)]
        provider: Option<String>,
        /// Working directory (absolute guest path or project-relative)
        #[arg(long, default_value = "")]
        cwd: String,
        /// Extra environment, K=V (repeatable)
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,
        /// Command timeout in seconds (0 = backend default)
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },
    /// Start an interactive shell in the sandbox
    Start {
        /// Override the configured provider
        #[arg(long)]
        provider: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.json {
        logging::LogFormat::Json
    } else {
        logging::LogFormat::Human
    });

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || cancel.cancel());
    }

    let service = SandboxService::new()?;
    let project_root = std::env::current_dir()?;

    match cli.command {
        Commands::Init { image, provider } => {
            cmd_init(&service, project_root, image, provider, cli.json, &cancel)
        }
        Commands::Probe { provider } => cmd_probe(&service, &provider, cli.json),
        Commands::Exec {
            command,
            provider,
            cwd,
            env,
            timeout,
        } => cmd_exec(
            &service,
            &project_root,
            command,
            provider,
            cwd,
            env,
            timeout,
            cli.json,
            &cancel,
        ),
        Commands::Start { provider } => {
            cmd_start(&service, &project_root, provider, cli.json, &cancel)
        }
    }
}

/// Progress printer for interactive use; bridge mode stays silent on
/// stdout and relies on stderr logs instead.
fn progress_printer(json: bool) -> ProgressFn {
    if json {
        return noop_progress();
    }
    Arc::new(|event| match event {
        ProgressEvent::Phase { name } => eprintln!("[vibebox] {}...", name),
        ProgressEvent::Transfer {
            done,
            total,
            percent,
            bytes_per_sec,
            ..
        } if total > 0 => {
            eprintln!(
                "[vibebox]   {:>5.1}%  {}/{} MiB  {:.1} MiB/s",
                percent,
                done / (1 << 20),
                total / (1 << 20),
                bytes_per_sec / (1 << 20) as f64
            );
        }
        ProgressEvent::Error { message } => eprintln!("[vibebox] error: {}", message),
        _ => {}
    })
}

fn cmd_init(
    service: &SandboxService,
    project_root: PathBuf,
    image: String,
    provider: String,
    json: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let config = service.initialize(
        &InitializeRequest {
            project_root,
            provider,
            image_id: image,
        },
        &progress_printer(json),
        cancel,
    )?;
    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "provider": config.provider })
        );
    } else {
        println!(
            "[vibebox] Initialized: provider={} image={}@{}",
            config.provider, config.vm.image_id, config.vm.image_version
        );
    }
    Ok(())
}

fn cmd_probe(service: &SandboxService, provider: &str, json: bool) -> Result<()> {
    let report = service.probe(provider);
    let bridge = ProbeBridge::from_report(&report);
    if json {
        println!("{}", serde_json::to_string(&bridge)?);
    } else if bridge.ok {
        println!("[vibebox] selected: {}", bridge.selected);
        if bridge.was_fallback {
            println!("[vibebox] fell back from: {}", bridge.fallback_from);
        }
    } else {
        eprintln!(
            "[vibebox] no backend: {}",
            bridge.error.as_deref().unwrap_or("unknown error")
        );
        for (name, diag) in &bridge.diagnostics {
            if !diag.available {
                eprintln!("[vibebox]   {}: {}", name, diag.reason);
                for hint in &diag.fix_hints {
                    eprintln!("[vibebox]     hint: {}", hint);
                }
            }
        }
    }
    // Exit code 0 iff ok.
    if !bridge.ok {
        std::process::exit(1);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_exec(
    service: &SandboxService,
    project_root: &std::path::Path,
    command: String,
    provider: Option<String>,
    cwd: String,
    env: Vec<String>,
    timeout: u64,
    json: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let mut request = ExecRequest::new(command);
    request.cwd = cwd;
    request.env = parse_env(&env)?;
    request.timeout = Duration::from_secs(timeout);

    let report = service.exec(
        project_root,
        provider.as_deref(),
        &request,
        &progress_printer(json),
        cancel,
    );
    let bridge = ExecBridge::from_report(&report);

    if json {
        println!("{}", serde_json::to_string(&bridge)?);
    } else {
        use std::io::Write;
        print!("{}", bridge.stdout);
        eprint!("{}", bridge.stderr);
        std::io::stdout().flush()?;
        if let Some(error) = &bridge.error {
            eprintln!("[vibebox] error: {}", error);
        }
    }

    // On success the process exit code mirrors the command's; on
    // bridge/selection failure it is non-zero with ok=false.
    let code = if bridge.ok { bridge.exit_code } else { 1 };
    if code != 0 {
        std::process::exit(code.clamp(1, 255));
    }
    Ok(())
}

fn cmd_start(
    service: &SandboxService,
    project_root: &std::path::Path,
    provider: Option<String>,
    json: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let report = service.start(
        project_root,
        provider.as_deref(),
        StartIo::host(),
        &progress_printer(json),
        cancel,
    );
    let selection = report.selection?;
    if !json {
        eprintln!("[vibebox] session ended ({})", selection.provider);
    }
    Ok(())
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --env {:?} (expected KEY=VALUE)", pair))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}
