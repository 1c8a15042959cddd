//! Ensemble xtask - Build automation tasks
//!
//! ## Usage
//!
//! ```bash
//! cargo xtask build [--release]
//! cargo xtask test [--release]
//! cargo xtask rehearse [--manifest ensemble.yaml]
//! cargo xtask lint
//! cargo xtask fmt [--check]
//! cargo xtask clean
//! cargo xtask install
//! cargo xtask release
//! cargo xtask ci
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation for Ensemble")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the library and the ensemble binary
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Run all tests
    Test {
        /// Run tests in release mode
        #[arg(long)]
        release: bool,
    },
    /// Validate a manifest and roll it on the simulated platform
    Rehearse {
        /// Manifest to rehearse
        #[arg(long, default_value = "ensemble.yaml")]
        manifest: PathBuf,
    },
    /// Run lints (clippy and rustfmt check)
    Lint,
    /// Format code
    Fmt {
        /// Check formatting without making changes
        #[arg(long)]
        check: bool,
    },
    /// Clean build artifacts
    Clean,
    /// Install the ensemble binary locally
    Install,
    /// Build release artifacts
    Release,
    /// Generate documentation
    Doc {
        /// Open documentation in browser
        #[arg(long)]
        open: bool,
    },
    /// Run CI checks (fmt, lint, test, build)
    Ci,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let project_root = project_root()?;
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build { release } => build(&sh, release)?,
        Commands::Test { release } => test(&sh, release)?,
        Commands::Rehearse { manifest } => rehearse(&sh, &manifest)?,
        Commands::Lint => lint(&sh)?,
        Commands::Fmt { check } => fmt(&sh, check)?,
        Commands::Clean => clean(&sh)?,
        Commands::Install => install(&sh)?,
        Commands::Release => release(&sh)?,
        Commands::Doc { open } => doc(&sh, open)?,
        Commands::Ci => ci(&sh)?,
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("Failed to run cargo locate-project")?;

    let path = String::from_utf8(output.stdout)?;
    let manifest = PathBuf::from(path.trim());

    manifest
        .parent()
        .map(|p| p.to_path_buf())
        .context("Failed to find project root")
}

fn build(sh: &Shell, release: bool) -> Result<()> {
    println!("🔨 Building Ensemble...");

    if release {
        cmd!(sh, "cargo build --release --bin ensemble").run()?;
    } else {
        cmd!(sh, "cargo build --bin ensemble").run()?;
    }

    println!("✅ Build complete!");
    Ok(())
}

fn test(sh: &Shell, release: bool) -> Result<()> {
    println!("🧪 Running tests...");

    if release {
        cmd!(sh, "cargo test --workspace --release").run()?;
    } else {
        cmd!(sh, "cargo test --workspace").run()?;
    }

    println!("✅ All tests passed!");
    Ok(())
}

fn rehearse(sh: &Shell, manifest: &Path) -> Result<()> {
    println!("🎭 Rehearsing {} on the simulated platform...", manifest.display());

    if !manifest.exists() {
        anyhow::bail!("Manifest {} not found", manifest.display());
    }

    cmd!(sh, "cargo run --bin ensemble -- --file {manifest} validate").run()?;
    cmd!(sh, "cargo run --bin ensemble -- --file {manifest} --simulate roll --unordered").run()?;

    println!("✅ Rehearsal complete!");
    Ok(())
}

fn lint(sh: &Shell) -> Result<()> {
    println!("🔍 Running lints...");

    println!("  Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;

    println!("  Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets --all-features -- -D warnings").run()?;

    println!("✅ All lints passed!");
    Ok(())
}

fn fmt(sh: &Shell, check: bool) -> Result<()> {
    println!("🎨 Formatting code...");

    if check {
        cmd!(sh, "cargo fmt --all -- --check").run()?;
    } else {
        cmd!(sh, "cargo fmt --all").run()?;
    }

    println!("✅ Formatting complete!");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 Cleaning build artifacts...");

    cmd!(sh, "cargo clean").run()?;

    println!("✅ Clean complete!");
    Ok(())
}

fn install(sh: &Shell) -> Result<()> {
    println!("📥 Installing Ensemble locally...");

    cmd!(sh, "cargo install --path .").run()?;

    println!("✅ Installation complete!");
    println!("  Installed: ensemble");
    Ok(())
}

fn release(sh: &Shell) -> Result<()> {
    println!("🚀 Building release artifacts...");

    build(sh, true)?;

    let release_dir = Path::new("target/release-artifacts");
    if release_dir.exists() {
        std::fs::remove_dir_all(release_dir)?;
    }
    std::fs::create_dir_all(release_dir)?;

    let src = Path::new("target/release/ensemble");
    if src.exists() {
        std::fs::copy(src, release_dir.join("ensemble"))?;
        println!("  Copied ensemble");
    }

    for manifest in ["ensemble.yaml", "ensemble.yml"] {
        if Path::new(manifest).exists() {
            std::fs::copy(manifest, release_dir.join(manifest))?;
            println!("  Copied {}", manifest);
        }
    }

    println!("✅ Release artifacts ready in target/release-artifacts/");
    Ok(())
}

fn doc(sh: &Shell, open: bool) -> Result<()> {
    println!("📚 Generating documentation...");

    if open {
        cmd!(sh, "cargo doc --no-deps --open").run()?;
    } else {
        cmd!(sh, "cargo doc --no-deps").run()?;
    }

    println!("✅ Documentation generated!");
    Ok(())
}

fn ci(sh: &Shell) -> Result<()> {
    println!("🔄 Running CI checks...");

    println!("\n📋 Step 1/4: Format check");
    fmt(sh, true)?;

    println!("\n📋 Step 2/4: Lint");
    lint(sh)?;

    println!("\n📋 Step 3/4: Tests");
    test(sh, false)?;

    println!("\n📋 Step 4/4: Release build");
    build(sh, true)?;

    println!("\n✅ All CI checks passed!");
    Ok(())
}
