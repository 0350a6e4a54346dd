mod adapter;
mod config;
mod progress;
mod remote;
mod services;
mod util;

use std::{io::IsTerminal, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::{
    adapter::{
        fs::{walk, RemotePathMapping, WalkOptions},
        ssh::SshConnector,
    },
    config::{read_config, ssh::SshTarget, ConfigContext, HostKeyPolicy},
    progress::ProgressView,
    remote::{
        purge::purge_command,
        transfer::{FailureReason, UploadOptions},
        CancelToken,
    },
    services::deploy::{deploy, DeployPlan, DeploymentResult},
    util::read_from_stdin,
};

/// Replace a remote directory's contents with a local build, over SSH.
#[derive(Debug, Parser)]
#[command(name = "mirror-deploy", version, about, long_about = None)]
struct Cli {
    /// Deployment file
    #[arg(short, long, env = "MIRROR_DEPLOY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the host key policy from the deployment file
    #[arg(long, value_enum)]
    host_key: Option<HostKeyPolicy>,

    /// Print the purge command and the files that would be sent, without connecting
    #[arg(long)]
    dry_run: bool,

    /// Log every remote operation
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print warnings, errors and the final summary
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let config_ctx = read_config(cli.config.clone()).context("loading deployment file")?;
    let definition = config_ctx.deploy();
    let plan = build_plan(&config_ctx);

    if cli.dry_run {
        print_dry_run(&plan)?;
        return Ok(0);
    }

    let target = SshTarget::resolve(&definition.host).context("resolving ssh target")?;
    let user = match target.user.clone() {
        Some(user) => user,
        None => read_from_stdin(false, "Username: ")
            .context("reading username")?
            .to_string(),
    };
    let credential = definition
        .auth
        .resolve(&user, &target.identity_files)
        .context("resolving credentials")?;

    let connector = SshConnector {
        target,
        user,
        credential,
        host_key: cli.host_key.unwrap_or(definition.host.host_key),
        known_hosts: definition.host.known_hosts_path(),
        timeout: definition.host.timeout(),
    };

    let cancel = CancelToken::new();
    let visible = !cli.quiet && std::io::stdout().is_terminal();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping after the current operation");
            signal_cancel.cancel();
        }
    });

    // libssh2 blocks, so the whole run lives on a blocking thread.
    let result = tokio::task::spawn_blocking(move || {
        let mut progress = ProgressView::new("Deploying", visible);
        deploy(&connector, &plan, &cancel, &mut progress)
    })
    .await
    .context("deployment worker panicked")?;

    print_summary(&result);
    Ok(result.exit_code())
}

fn build_plan(config_ctx: &ConfigContext) -> DeployPlan {
    let mirror = &config_ctx.deploy().mirror;

    DeployPlan {
        mapping: RemotePathMapping::new(&config_ctx.local_root(), &mirror.dest),
        exclusions: mirror.exclusions(),
        walk: WalkOptions {
            follow_links: mirror.follow_links,
        },
        upload: UploadOptions {
            retries: mirror.retries,
        },
    }
}

fn print_dry_run(plan: &DeployPlan) -> Result<()> {
    println!("# purge");
    println!("{}", purge_command(plan.mapping.remote_root(), &plan.exclusions));
    println!("# upload");

    for batch in walk(plan.mapping.local_root(), plan.walk) {
        let batch = batch.context("walking local tree")?;
        println!("mkdir {}", plan.mapping.remote_dir(&batch.relative_dir));
        for file in &batch.files {
            println!("- {}", plan.mapping.transfer_unit(&batch.relative_dir, file));
        }
    }

    Ok(())
}

fn print_summary(result: &DeploymentResult) {
    let report = &result.report;

    if let Some(fatal) = &result.fatal {
        eprintln!("Deployment failed during {}: {fatal}", fatal.phase());
        return;
    }

    println!(
        "Uploaded {} files ({} bytes) in {:.1}s [run {}]",
        report.uploaded.len(),
        report.bytes,
        result.elapsed.as_secs_f64(),
        result.run_id
    );

    if report.cancelled {
        eprintln!("Deployment cancelled; files already uploaded were left in place");
    }

    for failure in &report.directory_failures {
        eprintln!("Could not create {}: {}", failure.remote_dir, failure.error);
    }
    for err in &report.walk_errors {
        eprintln!("Skipped: {err}");
    }

    if !report.failed.is_empty() {
        eprintln!("{} files failed to upload:", report.failed.len());
        for failure in &report.failed {
            let reason = match &failure.reason {
                FailureReason::Upload(err) => err.to_string(),
                FailureReason::MissingDirectory { remote_dir } => {
                    format!("{remote_dir} could not be created")
                }
            };
            eprintln!(
                "  {} -> {}: {reason}",
                failure.unit.local_source.display(),
                failure.unit.remote_dest
            );
        }
    }

    if result.is_success() {
        println!("Deploy complete!");
    }
}
