use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

mod config;
mod deployer;
mod docker;
mod error;
mod executor;
mod git;
mod image;
mod manifest;
mod notify;
mod reconcile;

use deployer::Deployer;

#[derive(Parser)]
#[command(name = "kube-shipper", version)]
#[command(about = "Build, push and roll out container images from a git commit")]
struct Cli {
    /// Config file or project root (defaults to the current directory)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show live cluster state for the manifests of a context
    Status {
        /// Branch, tag or abbreviated commit id
        reference: Option<String>,
        #[command(flatten)]
        target: Target,
    },
    /// Build the configured images at a commit
    Build {
        reference: Option<String>,
    },
    /// Build and push the configured images
    Push {
        reference: Option<String>,
    },
    /// Full pass: build, push, rewrite manifests, apply, notify
    Deploy {
        reference: Option<String>,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Deployment context (defaults to the configured default context)
    #[arg(short, long)]
    context: Option<String>,

    /// Shorthand for the configured production context
    #[arg(short, long, conflicts_with = "context")]
    production: bool,
}

impl Target {
    fn resolve(&self, config: &config::Config) -> String {
        if self.production {
            config.production_context.clone()
        } else {
            self.context
                .clone()
                .unwrap_or_else(|| config.default_context.clone())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let config = config::load(&root)?;
    let mut deployer = Deployer::new(config).await?;

    match cli.command {
        Commands::Status { reference, target } => {
            let context = target.resolve(deployer.config());
            resolve(&mut deployer, reference).await?;
            show_status(&mut deployer, &context).await?;
        }
        Commands::Build { reference } => {
            resolve(&mut deployer, reference).await?;
            deployer.build().await?;
        }
        Commands::Push { reference } => {
            resolve(&mut deployer, reference).await?;
            deployer.build().await?;
            deployer.push().await?;
        }
        Commands::Deploy { reference, target } => {
            let context = target.resolve(deployer.config());
            resolve(&mut deployer, reference).await?;
            deployer.build().await?;
            deployer.push().await?;
            let output = deployer.deploy(&context).await?;
            if !output.stdout.trim().is_empty() {
                println!("{}", output.stdout.trim_end());
            }
            if !output.stderr.trim().is_empty() {
                eprintln!("{}", output.stderr.trim_end());
            }
            info!("Deployed to context {}", context);
        }
    }
    Ok(())
}

async fn resolve(deployer: &mut Deployer, reference: Option<String>) -> anyhow::Result<()> {
    let reference = reference.unwrap_or_else(|| deployer.config().default_branch.clone());
    deployer
        .set_ref(&reference)
        .await
        .with_context(|| format!("resolving '{reference}'"))?;
    Ok(())
}

async fn show_status(deployer: &mut Deployer, context: &str) -> anyhow::Result<()> {
    let statuses = deployer
        .status(context)
        .await?
        .with_context(|| format!("could not query live state for context {context}"))?;

    let expected = deployer.tag().unwrap_or_default().to_string();
    for entry in statuses {
        let kind = entry.manifest.kind().unwrap_or("?");
        let name = entry.manifest.name().unwrap_or("?");
        match entry.live {
            Some(live) => {
                let marker = if live.tag == expected {
                    "up to date"
                } else {
                    "outdated"
                };
                println!("{}/{}: running {} ({})", kind.to_lowercase(), name, live.tag, marker);
            }
            None => println!("{}/{}: not deployed", kind.to_lowercase(), name),
        }
    }
    Ok(())
}
