//! Ensemble - launch and roll clusters of processes
//!
//! This is the main CLI entry point for Ensemble.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ensemble::cluster::{Cluster, MemberInfo, RelaunchPolicy};
use ensemble::manifest::{ManifestConfig, ManifestParser};
use ensemble::platform::{LocalPlatform, Platform, SimulatedPlatform};
use ensemble::stability::{StabilityConfig, StabilityPredicate};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Ensemble - cluster launcher with rolling restarts
#[derive(Parser)]
#[command(name = "ensemble")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Launch a cluster of processes and roll it safely", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Manifest file (defaults to ensemble.yaml or ensemble.yml)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Launch simulated processes instead of real ones
    #[arg(long, global = true)]
    simulate: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the manifest
    Validate,

    /// Launch the cluster and keep it up until Ctrl-C
    Up,

    /// Launch the cluster and relaunch its members one at a time
    Roll {
        /// Only relaunch members of this role
        #[arg(short, long)]
        role: Option<String>,
        /// Stability timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Visit members in random order
        #[arg(short, long)]
        unordered: bool,
        /// Skip the stability check before the first relaunch
        #[arg(long)]
        no_pre_check: bool,
    },

    /// Launch the cluster and clone a member of a role
    Clone {
        /// Role to clone
        role: String,
        /// Number of copies
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },
}

fn load_manifest(file: Option<&Path>) -> anyhow::Result<(PathBuf, ManifestConfig)> {
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("Failed to read the current directory")?;
            match ManifestParser::find_manifest_file(&cwd) {
                Some(path) => path,
                None => bail!("No ensemble.yaml or ensemble.yml found in {}", cwd.display()),
            }
        }
    };

    let mut manifest = ManifestParser::parse_file(&path)?;
    let env = std::env::vars().collect();
    ManifestParser::interpolate(&mut manifest, &env);

    for warning in ManifestParser::validate(&manifest)? {
        tracing::warn!("{}", warning);
    }

    Ok((path, manifest))
}

async fn build(manifest: &ManifestConfig, platform: Arc<dyn Platform>) -> anyhow::Result<Cluster> {
    let builder = ManifestParser::to_builder(manifest)?
        .stable_when(StabilityPredicate::all_operational())
        .stability(manifest.stability_config(StabilityConfig::from_env()?)?);

    let cluster = tokio::task::spawn_blocking(move || builder.build(platform, Default::default()))
        .await
        .context("Cluster build task failed")??;

    Ok(cluster)
}

async fn close(cluster: Cluster) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || cluster.close())
        .await
        .context("Cluster close task failed")??;
    Ok(())
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn print_members(json: bool, members: &[MemberInfo]) -> anyhow::Result<()> {
    print(json, &members, |members| {
        println!("{:<24} {:<12} {:<10} {:<8} LAUNCHED", "NAME", "ROLE", "PLATFORM", "PID");
        for member in members.iter() {
            println!(
                "{:<24} {:<12} {:<10} {:<8} {}",
                member.name,
                member.role,
                member.platform,
                member.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string()),
                member.launched_at.format("%H:%M:%S")
            );
        }
    })
}

fn member_infos(cluster: &Cluster) -> Vec<MemberInfo> {
    cluster.members().iter().map(|member| member.info()).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let (path, manifest) = load_manifest(cli.file.as_deref())?;

    let platform: Arc<dyn Platform> = if cli.simulate {
        Arc::new(SimulatedPlatform::new())
    } else {
        Arc::new(LocalPlatform::new())
    };

    match cli.command {
        Commands::Validate => {
            let size: usize = manifest.roles.iter().map(|role| role.count).sum();
            println!(
                "{} is valid: {} role(s), {} member(s)",
                path.display(),
                manifest.roles.len(),
                size
            );
        }

        Commands::Up => {
            let cluster = build(&manifest, platform).await?;
            print_members(cli.json, &member_infos(&cluster))?;

            tracing::info!("Cluster {} is up, press Ctrl-C to stop it", cluster.id());
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;

            close(cluster).await?;
        }

        Commands::Roll {
            role,
            timeout,
            unordered,
            no_pre_check,
        } => {
            let stability = manifest.stability_config(StabilityConfig::from_env()?)?;
            let timeout = timeout.map(Duration::from_secs).unwrap_or(stability.timeout);
            let policy = RelaunchPolicy::new(timeout)
                .stability(stability)
                .pre_check(!no_pre_check);

            let cluster = build(&manifest, platform).await?;

            let rolling = cluster.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut view = match &role {
                    Some(role) => rolling.filter(|member| member.role().name() == role.as_str()),
                    None => rolling.view(),
                };
                if unordered {
                    view = view.unordered();
                }
                view.relaunch_with(&StabilityPredicate::all_operational(), &policy)
            })
            .await
            .context("Relaunch task failed")?;

            let closed = close(cluster).await;
            let report = result?;

            print(cli.json, &report, |report| {
                for replacement in &report.replacements {
                    println!("{} -> {}", replacement.replaced, replacement.replacement);
                }
                for skipped in &report.skipped {
                    println!("{} skipped", skipped);
                }
            })?;
            closed?;
        }

        Commands::Clone { role, count } => {
            let cluster = build(&manifest, platform).await?;

            let cloning = cluster.clone();
            let result = tokio::task::spawn_blocking(move || {
                let view = cloning.filter(|member| member.role().name() == role).limit(1);
                if view.is_empty() {
                    bail!("No member of role '{}' to clone", role);
                }
                Ok(view.clone_members(count)?)
            })
            .await
            .context("Clone task failed")?;

            let members = result.map(|cloned| cloned.iter().map(|m| m.info()).collect::<Vec<_>>());
            let closed = close(cluster).await;

            print_members(cli.json, &members?)?;
            closed?;
        }
    }

    Ok(())
}
