use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use fwb_core::{
    fingerprint, usign, BuildRequest, Config, JobState, Service, Target, ToolchainKey,
    ToolchainSource,
};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "fwb", version, about = "On-demand firmware builds")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Submit a build, wait for it and print the job as JSON
    Build(RequestArgs),
    /// Print the request key without touching disk or network
    Fingerprint(RequestArgs),
    /// Check a usign signature over a file
    Verify {
        #[arg(long)]
        signature: PathBuf,
        #[arg(long)]
        message: PathBuf,
        /// Public key text; defaults to the configured upstream key
        #[arg(long)]
        key: Option<String>,
    },
    /// Ensure a toolchain is present and current, then print its provenance
    Toolchain {
        #[arg(long)]
        version: String,
        /// target/subtarget, e.g. ath79/generic
        #[arg(long)]
        target: String,
    },
}

#[derive(Args)]
struct RequestArgs {
    #[arg(long)]
    distro: Option<String>,
    #[arg(long)]
    version: String,
    #[arg(long)]
    profile: String,
    /// Package to add, or `-name` to remove; repeatable
    #[arg(long = "package", allow_hyphen_values = true)]
    packages: Vec<String>,
    /// Treat the package list as the complete desired set
    #[arg(long)]
    diff_packages: bool,
}

impl From<RequestArgs> for BuildRequest {
    fn from(args: RequestArgs) -> Self {
        BuildRequest {
            distro: args.distro,
            version: Some(args.version),
            profile: Some(args.profile),
            packages: args.packages,
            diff_packages: args.diff_packages,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Fingerprint(args) => {
            let request = BuildRequest::from(args);
            println!("{}", fingerprint(&request));
        }
        Cmd::Verify {
            signature,
            message,
            key,
        } => {
            let key = key.unwrap_or_else(|| Config::from_env().upstream_key);
            match usign::check_files(&signature, &message, &key) {
                Ok(true) => println!("valid"),
                Ok(false) => return Err("signature does not verify".into()),
                Err(err) => return Err(format!("malformed input: {err}").into()),
            }
        }
        Cmd::Toolchain { version, target } => {
            fwb_util::init_tracing()?;
            let target = Target::parse(&target)
                .ok_or_else(|| format!("target must look like target/subtarget, got {target:?}"))?;
            let service = Service::with_catalog(Config::from_env(), Default::default())?;
            let key = ToolchainKey::new(&version, target);
            let toolchain = service.bootstrapper.ensure(&key).await?;
            info!("Toolchain ready at {}", toolchain.dir.display());
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "dir": toolchain.dir,
                    "provenance": toolchain.provenance(),
                }))?
            );
        }
        Cmd::Build(args) => {
            fwb_util::init_tracing()?;
            let service = Service::new(Config::from_env())?;
            let _workers = service.start_workers();

            let request = BuildRequest::from(args);
            let submission = match service.orchestrator.submit(&request).await {
                Ok(submission) => submission,
                Err(err) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "status": err.status(),
                            "http_status": err.http_status(),
                            "detail": err.to_string(),
                        }))?
                    );
                    return Err(err.into());
                }
            };
            info!("Job {} submitted", submission.job.id);

            let job = service
                .orchestrator
                .wait(&submission.job.id)
                .await
                .ok_or("job disappeared before finishing")?;
            let failed = job.state == JobState::Failed;
            let url = job
                .result
                .as_ref()
                .map(|artifact| service.config.public_url(&artifact.relative_dir));
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "job": job, "url": url }))?
            );
            if failed {
                return Err("build failed".into());
            }
        }
    }

    Ok(())
}
