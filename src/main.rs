use clap::Parser;
use pypi_mirror::cli::{Cli, Commands, OutputFormat};
use pypi_mirror::config::MirrorConfig;
use pypi_mirror::error::exit_code_for_kind;
use pypi_mirror::events::{EventLog, EventSink};
use pypi_mirror::{controller, progress, verify};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

fn main() -> ExitCode {
    color_eyre::install().ok();
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };
    let code = runtime.block_on(run(cli));
    ExitCode::from(code as u8)
}

/// Resolution order for the config path: explicit `--config`, then
/// `./mirror.conf`, then `/etc/pypi-mirror.conf` (the out-of-scope config
/// loader's conventional location).
fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let cwd_default = Path::new("mirror.conf");
    if cwd_default.exists() {
        return cwd_default.to_path_buf();
    }
    PathBuf::from("/etc/pypi-mirror.conf")
}

async fn run(cli: Cli) -> i32 {
    let config_path = resolve_config_path(cli.config.clone());
    let cfg = match MirrorConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error loading {}: {e}", config_path.display());
            return 2;
        }
    };

    let log: EventSink = Arc::new(Mutex::new(EventLog::new()));
    if !matches!(cli.format, OutputFormat::Json)
        && let Ok(mut guard) = log.lock()
    {
        let printer = progress::HumanPrinter::new(cli.debug);
        guard.set_listener(Box::new(move |event| printer.handle(event)));
    }

    let exit = match cli.command {
        Commands::Mirror(args) => {
            let options = controller::MirrorOptions { force_check: args.force_check };
            match controller::run(&cfg, options, &log).await {
                Ok(summary) => {
                    println!(
                        "mirror: {} succeeded, {} failed, {} file(s) downloaded, {} bytes, status {}",
                        summary.succeeded,
                        summary.failed,
                        summary.files_downloaded,
                        summary.bytes,
                        summary.target_serial
                    );
                    0
                }
                Err(e) => {
                    eprintln!("mirror run failed: {e}");
                    match e {
                        controller::ControllerError::LockContention => 3,
                        other => exit_code_for_kind(other.kind()),
                    }
                }
            }
        }
        Commands::Verify(args) => {
            let options = verify::VerifyOptions {
                delete: args.delete,
                json_update: args.json_update,
                dry_run: args.dry_run,
            };
            match verify::run(&cfg, options, &log).await {
                Ok(summary) => {
                    println!(
                        "verify: {} checked, {} removed, {} file(s) repaired, {} failed",
                        summary.checked, summary.removed, summary.repaired_files, summary.failed
                    );
                    if summary.failed > 0 { 1 } else { 0 }
                }
                Err(e) => {
                    eprintln!("verify run failed: {e}");
                    match e {
                        verify::VerifyError::LockContention => 3,
                        other => exit_code_for_kind(other.kind()),
                    }
                }
            }
        }
        Commands::Sync(args) => match controller::sync_one(&cfg, &args.project, &log).await {
            Ok(outcome) => {
                println!("sync {}: {:?}", args.project, outcome);
                0
            }
            Err(e) => {
                eprintln!("sync {} failed: {e}", args.project);
                match e {
                    controller::ControllerError::LockContention => 3,
                    other => exit_code_for_kind(other.kind()),
                }
            }
        },
        Commands::Delete(args) => match controller::delete(&cfg, &args.projects, &log).await {
            Ok(()) => {
                println!("deleted {} project(s)", args.projects.len());
                0
            }
            Err(e) => {
                eprintln!("delete failed: {e}");
                match e {
                    controller::ControllerError::LockContention => 3,
                    other => exit_code_for_kind(other.kind()),
                }
            }
        },
    };

    if matches!(cli.format, OutputFormat::Json)
        && let Ok(guard) = log.lock()
    {
        println!("{}", guard.to_ndjson());
    }

    exit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_config_path_prefers_explicit_flag() {
        let explicit = PathBuf::from("/tmp/custom.conf");
        assert_eq!(resolve_config_path(Some(explicit.clone())), explicit);
    }
}
