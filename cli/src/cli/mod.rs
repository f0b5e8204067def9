// cli/src/cli/mod.rs
mod deps;
mod health;
mod predict;
pub mod runner;

use anyhow::{Context, Result};
use colored::*;
use log::LevelFilter;
use snipper_core::utils::logging::{self, Console};
use snipper_daemon::config::DaemonConfig;
use std::env;
use std::path::PathBuf;
use structopt::{clap::AppSettings, StructOpt};

use self::{
    deps::DepsCommand,
    predict::{PredictImageCommand, PredictPdfCommand},
    runner::{use_daemon_from, TaskRunner, USE_DAEMON_ENV},
};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "snipper",
    about = "LaTeXSnipper command line front end",
    global_settings = &[AppSettings::DisableHelpSubcommand]
)]
pub struct AppCommand {
    /// Re-verify installed layers (strict) before running the command
    #[structopt(long)]
    force_deps_check: bool,

    /// Show client and daemon logs
    #[structopt(short, long)]
    verbose: bool,

    /// Optional JSON config file, shared with the daemon
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Start a daemon and print its health and contract
    #[structopt(name = "health")]
    Health,

    /// Recognize a single image
    #[structopt(name = "predict-image")]
    PredictImage(PredictImageCommand),

    /// Recognize the pages of a PDF
    #[structopt(name = "predict-pdf")]
    PredictPdf(PredictPdfCommand),

    /// Dependency layer management
    #[structopt(name = "deps")]
    Deps(DepsCommand),
}

/// Settings shared by every command.
pub struct Session {
    pub config: DaemonConfig,
    pub config_path: Option<PathBuf>,
    pub verbose: bool,
}

impl Session {
    /// Daemon-backed unless `LATEXSNIPPER_USE_DAEMON` turns it off.
    pub fn runner(&self) -> Result<TaskRunner> {
        let raw = env::var(USE_DAEMON_ENV).ok();
        if use_daemon_from(raw.as_deref()) {
            TaskRunner::daemon(&self.config.model, self.config_path.clone())
        } else {
            println!("{} {}=0: running in-process", "[INFO]".blue(), USE_DAEMON_ENV);
            Ok(TaskRunner::local(self.config.deps_dir.clone(), self.config.mirror))
        }
    }
}

impl AppCommand {
    pub fn execute(self) -> Result<()> {
        let level = if self.verbose { LevelFilter::Info } else { LevelFilter::Warn };
        logging::init(None, level, Console::Stderr)?;

        let config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };
        let session = Session { config, config_path: self.config.clone(), verbose: self.verbose };

        if self.force_deps_check {
            println!("{} verifying installed layers", "[INFO]".blue());
            let report = deps::run_check(session.config.deps_dir.as_deref(), true)
                .context("Dependency check failed")?;
            deps::print_check_report(&report);
        }

        match self.command {
            Command::Health => health::execute(&session),
            Command::PredictImage(cmd) => cmd.execute(&session),
            Command::PredictPdf(cmd) => cmd.execute(&session),
            Command::Deps(cmd) => cmd.execute(&session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_and_subcommands() {
        let cmd = AppCommand::from_iter_safe(["snipper", "--force-deps-check", "-v", "deps", "switch", "gpu", "--cuda-tag", "cu126"])
            .unwrap();
        assert!(cmd.force_deps_check);
        assert!(cmd.verbose);
        match cmd.command {
            Command::Deps(DepsCommand::Switch { target, cuda_tag, .. }) => {
                assert_eq!(target, "gpu");
                assert_eq!(cuda_tag.as_deref(), Some("cu126"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_targets_and_formats() {
        assert!(AppCommand::from_iter_safe(["snipper", "deps", "switch", "tpu"]).is_err());
        assert!(AppCommand::from_iter_safe(["snipper", "predict-pdf", "a.pdf", "--format", "docx"]).is_err());
        assert!(AppCommand::from_iter_safe(["snipper", "predict-pdf", "a.pdf", "--format", "latex", "--dpi", "300"]).is_ok());
    }
}
