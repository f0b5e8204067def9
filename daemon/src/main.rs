// daemon/src/main.rs
use anyhow::{Context, Result};
use snipper_core::utils::logging::{self, Console};
use snipper_daemon::config::DaemonConfig;
use snipper_daemon::{DaemonServer, Services};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "snipper-daemon", about = "LaTeXSnipper recognition daemon")]
struct Opt {
    /// Address to listen on (overrides the config file)
    #[structopt(long)]
    host: Option<String>,

    /// Port to listen on
    #[structopt(long)]
    port: u16,

    /// Shared token every request must carry; empty disables the check
    #[structopt(long, default_value = "")]
    token: String,

    /// Recognition model family
    #[structopt(long)]
    model: Option<String>,

    /// Optional JSON config file
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let mut config = match &opt.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(host) = opt.host {
        config.host = host;
    }
    if let Some(model) = opt.model {
        config.model = model;
    }

    let level = logging::parse_level(&config.log_level);
    let log_file = config.log_file();
    if let Err(e) = logging::init(Some(&log_file), level, Console::Stdout) {
        // An unwritable log dir should not keep the daemon down.
        eprintln!("[daemon] file logging unavailable ({:#}); logging to stdout only", e);
        logging::init(None, level, Console::Stdout)?;
    }

    if config.model != "pix2text" {
        log::warn!("unsupported model family '{}', serving pix2text", config.model);
    }

    let services = Services::production(config.deps_dir.clone(), config.mirror);
    let server = DaemonServer::start(&config.host, opt.port, &opt.token, services)
        .with_context(|| format!("Failed to start daemon on {}:{}", config.host, opt.port))?;
    println!("[daemon] ready host={} port={} pid={}", config.host, server.port(), std::process::id());

    server.wait();
    Ok(())
}
