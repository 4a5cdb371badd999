//! Replica-to-primary forwarding of staged mutations.
//!
//! A replica cannot write its queue tables, so its staging writer ships
//! each pending row to the primary over a small text protocol: one
//! connection per call, one parameterized `INSERT INTO <queue_table>
//! VALUES ($1, …, $n)` with text-encoded parameters, one status line
//! back. Only command success is inspected; there is no pooling and no
//! retry — a failed forward surfaces as a non-fatal error and the
//! caller's policy disables learning for the current query.
//!
//! Frames are length-prefixed so parameters may contain arbitrary bytes
//! (query text in particular):
//!
//! ```text
//! client:  *<nargs>\n   then per arg:   <len>\n<bytes>\n
//! server:  +OK\n  on success,  -ERR <message>\n  otherwise
//! ```
//!
//! The primary side runs a [`ForwardListener`]: an accept loop that hands
//! each connection to a short-lived handler thread. A forwarded command
//! is accepted only if it targets one of the queue tables; parameters are
//! parsed back into storable values by the declared column types and the
//! insert runs on the listener's local store.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::codec::{self, ColumnType, WireValue};
use crate::error::{KindlingError, Result};
use crate::model::EntityKind;
use crate::staging::{check_row_width, StagingWriter};

/// I/O timeout for one forwarding round trip.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard cap on one forwarded parameter, well above any encoded matrix.
const MAX_ARG_BYTES: usize = 4 << 20;

// ---------------------------------------------------------------------------
// Client side: the replica's staging writer
// ---------------------------------------------------------------------------

/// Staging writer for a replica node: forwards every pending row to the
/// primary instead of inserting locally.
#[derive(Debug, Clone)]
pub struct RemoteStagingWriter {
    primary_addr: String,
}

impl RemoteStagingWriter {
    /// Create a writer forwarding to the primary at `addr` ("host:port").
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            primary_addr: addr.into(),
        }
    }

    fn forward(&self, kind: EntityKind, row: &[WireValue]) -> Result<()> {
        // Encode everything before dialing; an encoding error must abort
        // the attempt without a half-written command on the wire.
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} VALUES ({})",
            kind.queue_table(),
            placeholders.join(", ")
        );
        let mut args = Vec::with_capacity(row.len() + 1);
        args.push(sql);
        for value in row {
            args.push(codec::encode_text(value)?);
        }

        let stream = TcpStream::connect(&self.primary_addr)
            .map_err(|e| KindlingError::remote(format!("connect {}: {e}", self.primary_addr)))?;
        stream.set_read_timeout(Some(FORWARD_TIMEOUT))?;
        stream.set_write_timeout(Some(FORWARD_TIMEOUT))?;

        let mut writer = stream.try_clone()?;
        write_frame(&mut writer, &args)
            .map_err(|e| KindlingError::remote(format!("send failed: {e}")))?;

        let mut reader = BufReader::new(stream);
        let mut status = String::new();
        reader
            .read_line(&mut status)
            .map_err(|e| KindlingError::remote(format!("no status from primary: {e}")))?;
        let status = status.trim_end();
        if status == "+OK" {
            Ok(())
        } else {
            Err(KindlingError::remote(format!(
                "primary rejected insert: {status}"
            )))
        }
    }
}

impl StagingWriter for RemoteStagingWriter {
    fn enqueue(&self, _conn: &Connection, kind: EntityKind, row: &[WireValue]) -> Result<()> {
        check_row_width(kind, row)?;
        self.forward(kind, row)
    }
}

// ---------------------------------------------------------------------------
// Wire framing
// ---------------------------------------------------------------------------

fn write_frame(stream: &mut impl Write, args: &[String]) -> std::io::Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("{}\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.push(b'\n');
    }
    stream.write_all(&buf)?;
    stream.flush()
}

fn read_frame(reader: &mut BufReader<TcpStream>) -> Result<Vec<String>> {
    let mut header = String::new();
    reader.read_line(&mut header)?;
    let count: usize = header
        .trim_end()
        .strip_prefix('*')
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KindlingError::protocol(format!("bad frame header {header:?}")))?;
    if count == 0 || count > 64 {
        return Err(KindlingError::protocol(format!("bad arg count {count}")));
    }

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_line = String::new();
        reader.read_line(&mut len_line)?;
        let len: usize = len_line
            .trim_end()
            .parse()
            .map_err(|_| KindlingError::protocol(format!("bad arg length {len_line:?}")))?;
        if len > MAX_ARG_BYTES {
            return Err(KindlingError::protocol(format!("arg too large: {len}")));
        }
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        let mut newline = [0u8; 1];
        reader.read_exact(&mut newline)?;
        if newline[0] != b'\n' {
            return Err(KindlingError::protocol("missing frame terminator"));
        }
        args.push(String::from_utf8(bytes).map_err(|_| {
            KindlingError::protocol("forwarded parameter is not valid UTF-8")
        })?);
    }
    Ok(args)
}

// ---------------------------------------------------------------------------
// Server side: the primary's forward listener
// ---------------------------------------------------------------------------

/// Accepts forwarded inserts from replicas and stages them into the local
/// queue tables.
pub struct ForwardListener {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ForwardListener {
    /// Bind to `addr` and start accepting forwarded inserts for the store
    /// at `store_path`.
    pub fn bind(addr: impl AsRef<str>, store_path: impl Into<PathBuf>) -> Result<Self> {
        let listener = TcpListener::bind(addr.as_ref())?;
        let local_addr = listener.local_addr()?;
        let store_path = store_path.into();
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);

        let thread = std::thread::Builder::new()
            .name("kindling-forward".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let path = store_path.clone();
                            std::thread::spawn(move || {
                                if let Err(err) = handle_connection(stream, &path) {
                                    debug!(error = %err, "forward connection closed");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            })
            .map_err(|e| KindlingError::worker(format!("failed to spawn listener: {e}")))?;

        Ok(Self {
            addr: local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// The bound address, useful when binding to an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop with one last connection to ourselves.
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ForwardListener {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn handle_connection(stream: TcpStream, store_path: &Path) -> Result<()> {
    stream.set_read_timeout(Some(FORWARD_TIMEOUT))?;
    stream.set_write_timeout(Some(FORWARD_TIMEOUT))?;
    let mut response = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let args = read_frame(&mut reader)?;
    match execute_forwarded(&args, store_path) {
        Ok(()) => response.write_all(b"+OK\n")?,
        Err(err) => {
            let message = err.to_string().replace('\n', " ");
            response.write_all(format!("-ERR {message}\n").as_bytes())?;
        }
    }
    Ok(())
}

/// Validate a forwarded command and stage its row locally.
///
/// Only `INSERT INTO <queue_table> VALUES ($1, …, $n)` commands are
/// accepted, and only for the four known queue tables; parameters are
/// bound positionally after parsing by declared column type.
fn execute_forwarded(args: &[String], store_path: &Path) -> Result<()> {
    let kind = parse_insert_command(&args[0])?;
    let columns = kind.column_decls();
    let params = &args[1..];
    if params.len() != columns.len() {
        return Err(KindlingError::protocol(format!(
            "{} parameters for {} columns",
            params.len(),
            columns.len()
        )));
    }

    let mut values = Vec::with_capacity(params.len());
    for (param, (_, decl)) in params.iter().zip(columns) {
        values.push(codec::parse_text(param, ColumnType::from_decl(decl)?)?);
    }

    let conn = crate::session::open_connection(store_path)?;
    let placeholders = vec!["?"; values.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} VALUES ({placeholders})",
        kind.queue_table()
    );
    conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

/// Extract the target queue table from a forwarded insert command.
fn parse_insert_command(sql: &str) -> Result<EntityKind> {
    let mut tokens = sql.split_whitespace();
    let insert = tokens.next().unwrap_or_default();
    let into = tokens.next().unwrap_or_default();
    let table = tokens.next().unwrap_or_default();
    let values = tokens.next().unwrap_or_default();
    if !insert.eq_ignore_ascii_case("insert")
        || !into.eq_ignore_ascii_case("into")
        || !values.to_ascii_uppercase().starts_with("VALUES")
    {
        return Err(KindlingError::protocol(format!(
            "unsupported forwarded command {sql:?}"
        )));
    }
    EntityKind::ALL
        .into_iter()
        .find(|kind| kind.queue_table() == table)
        .ok_or_else(|| KindlingError::protocol(format!("{table} is not a queue table")))
}
