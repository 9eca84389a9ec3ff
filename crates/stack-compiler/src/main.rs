//! `stackc`: topology compiler entry point.
//!
//! `build` sequence:
//! 1. Load and validate [`Config`] from the file and `STACK_*` environment.
//! 2. Initialise JSON logging.
//! 3. Pick collaborators: offline for `--dry-run`, otherwise Route 53, ACM and
//!    an existing ELBv2 load balancer looked up by name.
//! 4. Wire Ctrl-C to the build's cancellation token.
//! 5. Run the build plan and print the report.
//!
//! The exit code names the error kind: 2 config, 3 capacity, 4 validation,
//! 5 substrate, 6 timeout, 1 anything else.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use common::TopologyError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stack_compiler::aws::{AcmAuthority, AwsClients, ElbDirectory, Route53Dns};
use stack_compiler::compute::FargateSubstrate;
use stack_compiler::config::Config;
use stack_compiler::edge::{LoadBalancerDirectory, OfflineDirectory};
use stack_compiler::naming::offline::{Issuance, OfflineAuthority, OfflineDns};
use stack_compiler::naming::{CertificateAuthority, DnsProvider};
use stack_compiler::plan::{BuildFailure, BuildPlan, Builder};
use stack_compiler::report::{Format, Report};
use stack_compiler::telemetry;

#[derive(Debug, Parser)]
#[command(name = "stackc", version, about = "Compile a secure single-service topology")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full build pass and print the report.
    Build {
        /// YAML or JSON configuration file.
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Use in-process DNS and certificate collaborators.
        #[arg(long)]
        dry_run: bool,

        #[arg(long, value_enum, default_value = "json")]
        format: Format,
    },
    /// Print the build order.
    Plan {
        #[arg(long, value_enum, default_value = "json")]
        format: Format,
    },
    /// Load and statically check a configuration.
    Validate {
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Build {
            file,
            dry_run,
            format,
        } => build(file.as_deref(), dry_run, format).await,
        Command::Plan { format } => plan(format),
        Command::Validate { file } => validate(file.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(failure) = err.downcast_ref::<BuildFailure>() {
        return failure.error.exit_code();
    }
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TopologyError>())
        .map_or(1, TopologyError::exit_code)
}

/// Configuration problems that are not already typed are config errors.
fn load_config(file: Option<&Path>) -> Result<Config> {
    Config::load(file).map_err(|e| {
        if e.chain().any(|cause| cause.is::<TopologyError>()) {
            e
        } else {
            TopologyError::config("configuration", format!("{e:#}")).into()
        }
    })
}

async fn build(file: Option<&Path>, dry_run: bool, format: Format) -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = load_config(file)?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        cidr = %cfg.cidr,
        domain = %cfg.domain_name,
        dry_run,
        "stackc build starting"
    );

    // -----------------------------------------------------------------------
    // 3. Collaborators
    // -----------------------------------------------------------------------
    let substrate = FargateSubstrate::new();
    let (edge, dns, ca): (
        Box<dyn LoadBalancerDirectory>,
        Box<dyn DnsProvider>,
        Box<dyn CertificateAuthority>,
    ) = if dry_run {
        (
            Box::new(OfflineDirectory),
            Box::new(OfflineDns::with_zone(&cfg.domain_name)),
            Box::new(OfflineAuthority::new(Issuance::Immediate)),
        )
    } else {
        let aws = AwsClients::init(&cfg.region).await;
        (
            Box::new(ElbDirectory::new(aws.elb)),
            Box::new(Route53Dns::new(aws.route53.clone())),
            Box::new(AcmAuthority::new(aws.acm, aws.route53)),
        )
    };

    // -----------------------------------------------------------------------
    // 4. Cancellation
    // -----------------------------------------------------------------------
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, abandoning build");
            interrupt.cancel();
        }
    });

    // -----------------------------------------------------------------------
    // 5. Build + report
    // -----------------------------------------------------------------------
    let deployment = Builder::new(&cfg, &substrate, edge.as_ref(), dns.as_ref(), ca.as_ref())
        .with_cancellation(cancel)
        .run()
        .await
        .map_err(|failure| {
            warn!(
                error = %failure.error,
                completed = ?failure.completed,
                "build abandoned; no partial deployment is reported"
            );
            failure
        })?;

    println!("{}", Report::new(&deployment).render(format)?);
    Ok(())
}

fn plan(format: Format) -> Result<()> {
    let plan = BuildPlan::standard()?;
    let rendered = match format {
        Format::Json => serde_json::to_string_pretty(plan.steps())?,
        Format::Yaml => serde_yaml::to_string(plan.steps())?,
    };
    println!("{rendered}");
    Ok(())
}

fn validate(file: Option<&Path>) -> Result<()> {
    let cfg = load_config(file)?;
    println!(
        "configuration valid: {} in {} ({} zones), {} → {}",
        cfg.fqdn(),
        cfg.cidr,
        cfg.az_count,
        cfg.tls_port,
        cfg.app_port
    );
    Ok(())
}
