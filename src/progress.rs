//! Human-facing progress rendering: a `SyncEvent` listener that
//! prints colorized one-line updates via `console::style`, reusing the same
//! crate the event log doc calls out for human-facing summaries. `--debug`
//! raises what gets printed here; it never changes what `EventLog` records.

use crate::events::SyncEvent;
use console::style;

pub struct HumanPrinter {
    debug: bool,
}

impl HumanPrinter {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    pub fn handle(&self, event: &SyncEvent) {
        match event {
            SyncEvent::RunStarted { command } => {
                eprintln!("{} {command}", style("==>").bold().cyan());
            }
            SyncEvent::DiscoverComplete { target_serial, todo } => {
                eprintln!(
                    "{} target serial {target_serial}, {todo} project(s) to sync",
                    style("==>").bold().cyan()
                );
            }
            SyncEvent::ProjectStarted { project } => {
                if self.debug {
                    eprintln!("  {} {project}", style("start").dim());
                }
            }
            SyncEvent::ProjectSkipped { project, reason } => {
                eprintln!("  {} {project}: {reason}", style("skip").yellow());
            }
            SyncEvent::ProjectSucceeded {
                project,
                files_downloaded,
                bytes,
                releases_kept,
            } => {
                eprintln!(
                    "  {} {project}: {releases_kept} release(s), {files_downloaded} file(s), {bytes} bytes",
                    style("ok").green()
                );
            }
            SyncEvent::ProjectFailed { project, reason } => {
                eprintln!("  {} {project}: {reason}", style("fail").red().bold());
            }
            SyncEvent::DownloadStarted { project, filename } => {
                if self.debug {
                    eprintln!("    {} {project}/{filename}", style("fetch").dim());
                }
            }
            SyncEvent::DownloadFinished { project, filename, bytes } => {
                if self.debug {
                    eprintln!("    {} {project}/{filename} ({bytes} bytes)", style("fetched").dim());
                }
            }
            SyncEvent::SerialAdvanced { from, to } => {
                eprintln!("{} status {from} -> {to}", style("==>").bold().cyan());
            }
            SyncEvent::VerifyRepaired { project, filename } => {
                eprintln!("  {} {project}/{filename}", style("repair").magenta());
            }
            SyncEvent::RunFinished { succeeded, failed } => {
                let summary = format!("{succeeded} succeeded, {failed} failed");
                if *failed > 0 {
                    eprintln!("{} {summary}", style("done").red().bold());
                } else {
                    eprintln!("{} {summary}", style("done").green().bold());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_every_event_variant_without_panicking() {
        let printer = HumanPrinter::new(true);
        printer.handle(&SyncEvent::RunStarted { command: "mirror".into() });
        printer.handle(&SyncEvent::DiscoverComplete { target_serial: 10, todo: 2 });
        printer.handle(&SyncEvent::ProjectStarted { project: "peerme".into() });
        printer.handle(&SyncEvent::ProjectSkipped {
            project: "pyaib".into(),
            reason: "dropped by filter chain".into(),
        });
        printer.handle(&SyncEvent::ProjectSucceeded {
            project: "peerme".into(),
            files_downloaded: 1,
            bytes: 10,
            releases_kept: 1,
        });
        printer.handle(&SyncEvent::ProjectFailed {
            project: "numpy".into(),
            reason: "checksum mismatch".into(),
        });
        printer.handle(&SyncEvent::DownloadStarted { project: "peerme".into(), filename: "peerme-1.0.0.whl".into() });
        printer.handle(&SyncEvent::DownloadFinished {
            project: "peerme".into(),
            filename: "peerme-1.0.0.whl".into(),
            bytes: 10,
        });
        printer.handle(&SyncEvent::SerialAdvanced { from: 5, to: 10 });
        printer.handle(&SyncEvent::VerifyRepaired {
            project: "peerme".into(),
            filename: "peerme-1.0.0.whl".into(),
        });
        printer.handle(&SyncEvent::RunFinished { succeeded: 1, failed: 0 });
    }
}
