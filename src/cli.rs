//! CLI surface: a thin `clap::Parser`/`clap::Subcommand`
//! adapter from argv to the Controller/Verify entry points. Carries no sync
//! logic of its own — `main.rs` does the dispatching.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pypi-mirror",
    about = "One-way, idempotent replicator that mirrors a PyPI-style package index onto local storage",
    version,
    long_about = None
)]
pub struct Cli {
    /// Path to the INI-style mirror configuration file. Falls back to
    /// `./mirror.conf`, then `/etc/pypi-mirror.conf`, when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Raise human-facing verbosity. Does not change what's recorded in the
    /// event log.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit the run's event log as newline-delimited JSON instead of
    /// human-readable progress lines.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Full replication run.
    Mirror(MirrorArgs),
    /// Reconcile local state against authoritative upstream metadata.
    Verify(VerifyArgs),
    /// Process one named project outside the changelog delta cycle.
    Sync(SyncArgs),
    /// Remove named project(s) and their files.
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
pub struct MirrorArgs {
    /// Clear `status` before DISCOVER so every planned file is re-diffed
    /// against disk even though no serial advanced.
    #[arg(long)]
    pub force_check: bool,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Remove a project's tree when it's no longer known upstream.
    #[arg(long)]
    pub delete: bool,
    /// Regenerate a project's JSON metadata mirror after reconciling it.
    #[arg(long)]
    pub json_update: bool,
    /// Report what would change without writing or deleting anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Project name to process.
    #[arg(value_name = "PROJECT")]
    pub project: String,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Project name(s) to remove.
    #[arg(value_name = "PROJECT", required = true)]
    pub projects: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_force_check_parses() {
        let cli = Cli::parse_from(["pypi-mirror", "mirror", "--force-check"]);
        match cli.command {
            Commands::Mirror(args) => assert!(args.force_check),
            other => panic!("expected Mirror, got {other:?}"),
        }
    }

    #[test]
    fn delete_requires_at_least_one_project() {
        let err = Cli::try_parse_from(["pypi-mirror", "delete"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn global_config_flag_is_accepted_after_subcommand() {
        let cli = Cli::parse_from(["pypi-mirror", "--config", "/tmp/m.conf", "sync", "peerme"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/m.conf")));
    }
}
