// cli/src/cli/health.rs
use super::Session;
use crate::client::DaemonClient;
use anyhow::{Context, Result};
use colored::*;
use serde_json::{json, Value};
use snipper_core::rpc::contract::{ContractRegistry, METHOD_HEALTH};
use snipper_core::rpc::message::{reply_is_ok, str_field};
use std::time::Duration;

/// Starts a daemon, prints its health and checks the contract matches ours.
pub fn execute(session: &Session) -> Result<()> {
    let local = ContractRegistry::global().summary();
    println!("{} contract {} {} ({})", "[INFO]".blue(), local.name, local.version, local.path.cyan());

    let mut client = DaemonClient::new(session.config.model.as_str())
        .context("Failed to reserve a daemon port")?
        .with_daemon_config(session.config_path.clone());
    let result = client
        .start(None)
        .context("Failed to start the daemon")
        .and_then(|_| Ok(client.request(METHOD_HEALTH, json!({}), Duration::from_secs(5), false)?));
    client.stop(false);
    let reply = result?;

    if !reply_is_ok(&reply) {
        anyhow::bail!("health failed: {}", str_field(&reply, "error"));
    }
    println!(
        "{} daemon pid={} ready={} status={}",
        "[SUCCESS]".green(),
        reply.get("pid").and_then(Value::as_u64).unwrap_or(0),
        reply.get("ready").and_then(Value::as_bool).unwrap_or(false),
        str_field(&reply, "status")
    );

    let remote = reply.get("contract").and_then(Value::as_object);
    let remote_name = remote.and_then(|c| c.get("name")).and_then(Value::as_str).unwrap_or("");
    let remote_version = remote.and_then(|c| c.get("version")).and_then(Value::as_str).unwrap_or("");
    if remote_name != local.name || remote_version != local.version {
        println!(
            "{} contract skew: daemon speaks {} {}, client expects {} {}",
            "[WARN]".yellow(),
            remote_name,
            remote_version,
            local.name,
            local.version
        );
    }
    Ok(())
}
