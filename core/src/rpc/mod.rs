// core/src/rpc/mod.rs
pub mod contract;
pub mod message;

use serde_json::{Map, Value};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Upper bound for a single JSON line in either direction.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty daemon {0}")]
    Empty(&'static str),
    #[error("{0} too large: exceeds 8 MiB")]
    TooLarge(&'static str),
    #[error("invalid {0} type: expected a JSON object")]
    NotObject(&'static str),
    #[error("malformed {0}: {1}")]
    Json(&'static str, #[source] serde_json::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    /// Class name reported back to the caller in `error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            WireError::Json(..) => "JSONDecodeError",
            WireError::Timeout(_) => "TimeoutError",
            WireError::Io(_) => "OSError",
            _ => "ValueError",
        }
    }
}

fn map_io(err: io::Error, what: &'static str) -> WireError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => WireError::Timeout(what),
        _ => WireError::Io(err),
    }
}

/// Reads one newline-terminated line, refusing anything above [`MAX_LINE_BYTES`].
pub fn read_line<R: BufRead>(reader: &mut R, what: &'static str) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    reader
        .by_ref()
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .map_err(|e| map_io(e, what))?;

    let terminated = buf.last() == Some(&b'\n');
    if !terminated && buf.len() > MAX_LINE_BYTES {
        return Err(WireError::TooLarge(what));
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Err(WireError::Empty(what));
    }
    Ok(buf)
}

/// Decodes a line into a JSON object; arrays and scalars are rejected.
pub fn decode_object(line: &[u8], what: &'static str) -> Result<Map<String, Value>, WireError> {
    match serde_json::from_slice::<Value>(line).map_err(|e| WireError::Json(what, e))? {
        Value::Object(map) => Ok(map),
        _ => Err(WireError::NotObject(what)),
    }
}

/// Serializes `value` as a single line and flushes it.
pub fn write_line<W: Write>(writer: &mut W, value: &Value, what: &'static str) -> Result<(), WireError> {
    let mut bytes = serde_json::to_vec(value).map_err(|e| WireError::Json(what, e))?;
    if bytes.len() > MAX_LINE_BYTES {
        return Err(WireError::TooLarge(what));
    }
    bytes.push(b'\n');
    writer.write_all(&bytes).map_err(|e| map_io(e, what))?;
    writer.flush().map_err(|e| map_io(e, what))?;
    Ok(())
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, WireError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| WireError::Io(io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}:{}", host, port))))
}

/// Sends a request object and waits for the single reply line.
/// Each call opens and closes its own connection.
pub fn request_reply(host: &str, port: u16, request: &Value, timeout: Duration) -> Result<Map<String, Value>, WireError> {
    let timeout = timeout.max(Duration::from_millis(10));
    let addr = resolve(host, port)?;
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| map_io(e, "connection"))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    // --- Send Request ---
    let mut writer = stream.try_clone()?;
    write_line(&mut writer, request, "request")?;

    // --- Receive Reply ---
    let mut reader = BufReader::new(stream);
    let line = read_line(&mut reader, "response")?;
    decode_object(&line, "response")
}

/// Asks the OS for an unused loopback port.
pub fn find_free_port(host: &str) -> io::Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}
