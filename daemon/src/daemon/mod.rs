// daemon/src/daemon/mod.rs
pub mod handlers;
pub mod state;
pub mod tasks;
pub mod worker;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use snipper_core::error::TaskError;
use snipper_core::rpc::message::{str_field, ErrorCode, ErrorReply};
use snipper_core::rpc::{decode_object, read_line, write_line, WireError};
use snipper_core::utils::env_flag;
use state::{DaemonState, Services};
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Set to a truthy value to attach the error chain to failed replies.
pub const TRACE_ENV: &str = "LATEXSNIPPER_DAEMON_TRACE";

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// A running daemon: the listener thread, the task worker and their shared state.
pub struct DaemonServer {
    addr: SocketAddr,
    state: DaemonState,
    listener: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl DaemonServer {
    /// Binds `host:port` (port 0 picks a free one) and starts serving.
    pub fn start(host: &str, port: u16, token: &str, services: Services) -> Result<DaemonServer> {
        log::info!("Daemon starting, attempting to listen on {}:{}", host, port);
        let listener = TcpListener::bind((host, port)).with_context(|| format!("Failed to bind to {}:{}", host, port))?;
        listener.set_nonblocking(true).context("Failed to make the listener non-blocking")?;
        let addr = listener.local_addr().context("Failed to read the bound address")?;

        let (state, rx) = DaemonState::new(token, services);

        let worker_state = state.clone();
        let worker = thread::Builder::new()
            .name("snipper-task-worker".into())
            .spawn(move || worker::run_worker(worker_state, rx))
            .context("Failed to spawn the task worker")?;

        let accept_state = state.clone();
        let listener = thread::Builder::new()
            .name("snipper-listener".into())
            .spawn(move || accept_loop(listener, accept_state))
            .context("Failed to spawn the listener")?;

        log::info!("daemon_start host={} port={} pid={}", addr.ip(), addr.port(), std::process::id());
        Ok(DaemonServer { addr, state, listener: Some(listener), worker: Some(worker) })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Asks both threads to wind down; `wait` joins them.
    pub fn stop(&self) {
        self.state.begin_stop();
    }

    /// Blocks until the listener and the worker have exited.
    pub fn wait(mut self) {
        self.join_threads();
        log::info!("Daemon has shut down.");
    }

    fn join_threads(&mut self) {
        for handle in [self.listener.take(), self.worker.take()].into_iter().flatten() {
            if handle.join().is_err() {
                log::error!("daemon thread panicked");
            }
        }
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.listener.is_some() || self.worker.is_some() {
            self.stop();
            self.join_threads();
        }
    }
}

fn accept_loop(listener: TcpListener, state: DaemonState) {
    log::info!("Daemon ready and listening for connections.");
    while !state.is_stopping() {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("Accepted new connection from {}", peer);
                let conn_state = state.clone();
                let spawned = thread::Builder::new().name("snipper-conn".into()).spawn(move || {
                    if let Err(e) = handle_connection(stream, &conn_state, peer) {
                        log::error!("Error handling connection from {}: {:#}", peer, e);
                    }
                });
                if let Err(e) = spawned {
                    log::error!("Failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::error!("Failed to accept connection: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    log::info!("Shutdown signal received, stopping listener.");
}

/// One request line in, one reply line out.
fn handle_connection(stream: TcpStream, state: &DaemonState, peer: SocketAddr) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let mut writer = stream.try_clone().context("Failed to clone connection")?;
    let mut reader = BufReader::new(stream);

    let request = read_line(&mut reader, "request").and_then(|line| decode_object(&line, "request"));
    let reply = match request {
        Ok(request) => serve(state, &request, peer),
        // Peer closed without sending anything.
        Err(WireError::Empty(_)) => return Ok(()),
        Err(e @ (WireError::Io(_) | WireError::Timeout(_))) => return Err(e).context("Failed to read request"),
        Err(e) => {
            log::warn!("bad_request client={} error={}", peer, e);
            ErrorReply::new(format!("bad request: {}", e), e.error_type())
                .code(ErrorCode::RpcBadRequest)
                .to_value()
        }
    };

    write_line(&mut writer, &reply, "response").context("Failed to write reply")?;
    Ok(())
}

fn serve(state: &DaemonState, request: &Map<String, Value>, peer: SocketAddr) -> Value {
    let token = str_field(request, "token");
    if !state.token().is_empty() && token != state.token() {
        log::warn!("unauthorized client={}", peer);
        return ErrorReply::coded("unauthorized", ErrorCode::RpcUnauthorized).to_value();
    }

    let method = str_field(request, "method");
    let params = match request.get("params") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    log::info!("request_begin method={}", method);
    let started = Instant::now();
    let reply = match handlers::dispatch(state, method, &params) {
        Ok(reply) => reply,
        Err(err) => error_reply(method, err),
    };
    let ok = reply.get("ok").and_then(Value::as_bool).unwrap_or(false);
    let code = reply.get("error_code").and_then(Value::as_str).unwrap_or("");
    log::info!(
        "request_end method={} ok={} error_code={} elapsed_ms={}",
        method,
        ok,
        code,
        started.elapsed().as_millis()
    );
    reply
}

fn error_reply(method: &str, err: anyhow::Error) -> Value {
    if let Some(TaskError::Rpc { message, code, error_type, details }) = err.downcast_ref::<TaskError>() {
        let mut reply = ErrorReply::new(message.clone(), error_type.clone()).code(*code);
        if !details.is_empty() {
            reply = reply.details(Value::Object(details.clone()));
        }
        return reply.to_value();
    }

    let error_type = match err.downcast_ref::<TaskError>() {
        Some(task_err) => task_err.error_type().to_string(),
        None if err.downcast_ref::<io::Error>().is_some() => "OSError".to_string(),
        None => "RuntimeError".to_string(),
    };
    log::error!("request_exception method={} error_type={} error={:#}", method, error_type, err);
    let mut reply = ErrorReply::new(format!("{:#}", err), error_type);
    if env_flag(TRACE_ENV, false) {
        let chain = err.chain().map(|cause| cause.to_string()).collect::<Vec<_>>().join("\n");
        reply = reply.traceback(chain);
    }
    reply.to_value()
}

#[cfg(test)]
mod tests {
    use super::state::testing::stub_services;
    use super::*;
    use serde_json::json;
    use snipper_core::rpc::request_reply;
    use std::io::{BufRead, Write};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn call(server: &DaemonServer, token: &str, method: &str, params: Value) -> Map<String, Value> {
        let req = json!({"token": token, "method": method, "params": params});
        request_reply("127.0.0.1", server.port(), &req, TIMEOUT).unwrap()
    }

    fn raw_line(server: &DaemonServer, line: &[u8]) -> Value {
        let mut stream = TcpStream::connect(server.addr()).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream.write_all(line).unwrap();
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[test]
    fn unauthorized_has_no_side_effects() {
        let server = DaemonServer::start("127.0.0.1", 0, "secret", stub_services(1)).unwrap();
        let reply = call(&server, "wrong", "task_submit", json!({"kind": "predict_image", "params": {}}));
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error_type"], "PermissionError");
        assert_eq!(reply["error_code"], "RPC_UNAUTHORIZED");

        let reply = call(&server, "wrong", "warmup", json!({}));
        assert_eq!(reply["error_code"], "RPC_UNAUTHORIZED");
        let health = call(&server, "secret", "health", json!({}));
        assert_eq!(health["ok"], true);
        assert_eq!(health["ready"], false);
        assert_eq!(health["status"], "model not initialized");
    }

    #[test]
    fn malformed_lines_get_bad_request() {
        let server = DaemonServer::start("127.0.0.1", 0, "", stub_services(1)).unwrap();
        let reply = raw_line(&server, b"{not json\n");
        assert_eq!(reply["error_code"], "RPC_BAD_REQUEST");
        assert_eq!(reply["error_type"], "JSONDecodeError");

        let reply = raw_line(&server, b"[1, 2]\n");
        assert_eq!(reply["error_code"], "RPC_BAD_REQUEST");
        assert_eq!(reply["error_type"], "ValueError");

        // Still serving afterwards.
        assert_eq!(call(&server, "", "model_status", json!({}))["ok"], true);
    }

    #[test]
    fn coded_errors_carry_details() {
        let server = DaemonServer::start("127.0.0.1", 0, "", stub_services(1)).unwrap();
        let reply = call(&server, "", "task_status", json!({"task_id": "0123"}));
        assert_eq!(reply["error_type"], "FileNotFoundError");
        assert_eq!(reply["error_code"], "TASK_NOT_FOUND");
        assert_eq!(reply["details"]["task_id"], "0123");

        let reply = call(&server, "", "task_submit", json!({"kind": "x"}));
        assert_eq!(reply["error_code"], "TASK_KIND_UNSUPPORTED");
        assert!(reply.get("traceback").is_none());
    }

    #[test]
    fn runtime_errors_use_the_anyhow_chain() {
        let err = anyhow::anyhow!("disk gone").context("Failed to warm up");
        let reply = error_reply("warmup", err);
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "Failed to warm up: disk gone");
        assert_eq!(reply["error_type"], "RuntimeError");
    }

    #[test]
    fn shutdown_stops_both_threads() {
        let server = DaemonServer::start("127.0.0.1", 0, "", stub_services(1)).unwrap();
        assert_eq!(call(&server, "", "shutdown", json!({}))["ok"], true);
        let deadline = Instant::now() + TIMEOUT;
        while !server.state().is_stopping() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        server.wait();
    }
}
