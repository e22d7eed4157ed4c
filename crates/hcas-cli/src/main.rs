//! # hcas CLI
//!
//! Command-line interface for the hcas content-addressable filesystem:
//! import trees from directories or tar archives, label them, mount them
//! read-only, and collect garbage.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flate2::read::GzDecoder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hcas_fs::{import_path, import_tar};
use hcas_fuse::MountConfig;
use hcas_store::Store;

/// Namespace for image root labels.
const IMAGE_NAMESPACE: &str = "image";

/// hcas - hierarchical content-addressable file trees
#[derive(Parser)]
#[command(name = "hcas")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a labelled tree read-only
    Mount {
        /// Where to mount
        #[arg(value_name = "MOUNT_POINT")]
        mount_point: PathBuf,

        /// Store root directory
        #[arg(value_name = "HCAS_ROOT")]
        root: PathBuf,

        /// Label to resolve in the image namespace
        #[arg(value_name = "LABEL")]
        label: String,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Import a tar archive and label its root
    ImportTar {
        /// Store root directory (created if missing)
        #[arg(value_name = "HCAS_ROOT")]
        root: PathBuf,

        /// Tar file, `-` for stdin; .gz/.tgz are decompressed
        #[arg(value_name = "TAR_FILE")]
        tar_file: String,

        /// Label for the imported root
        #[arg(value_name = "LABEL")]
        label: String,
    },

    /// Import a local directory
    ImportPath {
        /// Store root directory (created if missing)
        #[arg(value_name = "HCAS_ROOT")]
        root: PathBuf,

        /// Directory to import
        #[arg(value_name = "DIR")]
        directory: PathBuf,
    },

    /// Collect unreferenced objects and orphaned temp data
    Gc {
        /// Store root directory
        #[arg(value_name = "HCAS_ROOT")]
        root: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn open_tar_stream(tar_file: &str) -> Result<Box<dyn Read>> {
    if tar_file == "-" {
        return Ok(Box::new(io::stdin()));
    }

    let file = File::open(tar_file).with_context(|| format!("failed to open {tar_file}"))?;
    let lower = tar_file.to_ascii_lowercase();
    if lower.ends_with(".gz") || lower.ends_with(".tgz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn run_mount(mount_point: PathBuf, root: PathBuf, label: String, allow_other: bool) -> Result<()> {
    let store = Store::open(&root)
        .with_context(|| format!("failed to open store at {}", root.display()))?;
    let session = store.session();

    let Some(root_name) = session.get_label(IMAGE_NAMESPACE, &label)? else {
        bail!("label not found: {label}");
    };
    info!(label = %label, root = %root_name, "mounting root object");

    hcas_fuse::mount(
        &store,
        &mount_point,
        root_name,
        &MountConfig { allow_other },
    )
    .context("mount failed")?;
    Ok(())
}

fn run_import_tar(root: PathBuf, tar_file: String, label: String) -> Result<()> {
    let store = Store::create(&root)
        .with_context(|| format!("failed to open store at {}", root.display()))?;
    let session = store.session();

    let reader = open_tar_stream(&tar_file)?;
    let name = import_tar(&session, reader).context("tar import failed")?;
    println!("imported tar archive to {name}");

    session.set_label(IMAGE_NAMESPACE, &label, Some(&name))?;
    println!("set label '{label}' -> {name}");
    Ok(())
}

fn run_import_path(root: PathBuf, directory: PathBuf) -> Result<()> {
    let store = Store::create(&root)
        .with_context(|| format!("failed to open store at {}", root.display()))?;
    let session = store.session();

    let name = import_path(&session, &directory)
        .with_context(|| format!("failed to import {}", directory.display()))?;
    println!("imported path to {name}");
    Ok(())
}

fn run_gc(root: PathBuf) -> Result<()> {
    let store = Store::open(&root)
        .with_context(|| format!("failed to open store at {}", root.display()))?;
    let complete = store.garbage_collect(None).context("gc failed")?;
    println!("gc complete: {complete}");
    Ok(())
}

fn main() -> Result<()> {
    init_logging();

    match Cli::parse().command {
        Commands::Mount {
            mount_point,
            root,
            label,
            allow_other,
        } => run_mount(mount_point, root, label, allow_other),
        Commands::ImportTar {
            root,
            tar_file,
            label,
        } => run_import_tar(root, tar_file, label),
        Commands::ImportPath { root, directory } => run_import_path(root, directory),
        Commands::Gc { root } => run_gc(root),
    }
}
