//! Electrum transport (async implementation behind a blocking facade).
//!
//! The tracker's workers call [`TxFetcher`] synchronously. Each call queues a
//! JSON-RPC request in the shared state and parks on a per-request
//! [`Signal`]; a background Tokio task drains the queue onto the socket and a
//! reader task correlates responses by request id.
//!
//! # Architecture
//! * **Shared State**: `Arc<Mutex<SharedState>>` between caller threads and the async task.
//! * **Command Queue**: callers push requests; the write loop flushes them.
//! * **Reply Slots**: one single-fire signal per in-flight request id.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bitcoin::Txid;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_native_tls::TlsConnector;

use crate::error::FetchError;
use crate::fetcher::TxFetcher;
use crate::sync::Signal;

// =====================================================================
// Utils
// =====================================================================

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a unique, monotonically increasing ID for JSON-RPC requests.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Splits `ssl://host:port` / `tcp://host:port` into host, port and TLS flag.
/// A bare `host:port` is treated as TLS.
pub fn parse_server(s: &str) -> Result<(String, u16, bool)> {
    let s = s.trim();
    let (rest, tls) = if let Some(rest) = s.strip_prefix("ssl://") {
        (rest, true)
    } else if let Some(rest) = s.strip_prefix("tcp://") {
        (rest, false)
    } else {
        (s, true)
    };

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("missing port in server address {:?}", s))?;
    if host.is_empty() {
        return Err(anyhow::anyhow!("missing host in server address {:?}", s));
    }
    Ok((host.to_string(), port.parse::<u16>()?, tls))
}

// =====================================================================
// Shared State
// =====================================================================

type Reply = Signal<Result<Value, FetchError>>;

#[derive(Debug)]
struct Request {
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Default)]
struct SharedState {
    /// Requests waiting to be written to the socket.
    command_queue: VecDeque<Request>,

    /// Request ID -> reply slot of the blocked caller.
    inflight_requests: HashMap<u64, Reply>,

    /// Set once the connection is gone; new requests fail fast.
    closed: Option<String>,
}

impl SharedState {
    fn fail_all(&mut self, reason: &str) {
        self.closed = Some(reason.to_string());
        self.command_queue.clear();
        for (_, reply) in self.inflight_requests.drain() {
            reply.set(Err(FetchError::Disconnected(reason.to_string())));
        }
    }
}

// =====================================================================
// Public Client (blocking facade)
// =====================================================================

pub struct ElectrumFetcher {
    state: Arc<Mutex<SharedState>>,
}

impl ElectrumFetcher {
    /// Connects to `server` and blocks until the version handshake was sent.
    pub fn connect(server: &str, timeout: Duration) -> Result<Self> {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let ready: Signal<Result<(), String>> = Signal::new();

        let bg_state = state.clone();
        let bg_ready = ready.clone();
        let target = server.to_string();

        std::thread::Builder::new()
            .name("electrum".into())
            .spawn(move || {
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        bg_ready.set(Err(e.to_string()));
                        return;
                    }
                };
                rt.block_on(async move {
                    match AsyncElectrumTask::connect(&target, bg_state.clone()).await {
                        Ok(mut task) => {
                            bg_ready.set(Ok(()));
                            if let Err(e) = task.run_forever().await {
                                log::error!("[ELECTRUM] write loop stopped: {:#}", e);
                            }
                        }
                        Err(e) => {
                            bg_ready.set(Err(format!("{:#}", e)));
                        }
                    }
                    bg_state.lock().fail_all("connection closed");
                });
            })?;

        match ready.wait_timeout(timeout) {
            Some(Ok(())) => {
                log::info!("[ELECTRUM] connected to {}", server);
                Ok(Self { state })
            }
            Some(Err(e)) => Err(anyhow::anyhow!("cannot connect to {}: {}", server, e)),
            None => Err(anyhow::anyhow!("timed out connecting to {}", server)),
        }
    }

    fn request(&self, method: &'static str, params: Value, timeout: Duration) -> Result<Value, FetchError> {
        let id = next_id();
        let reply: Reply = Signal::new();
        {
            let mut s = self.state.lock();
            if let Some(reason) = &s.closed {
                return Err(FetchError::Disconnected(reason.clone()));
            }
            s.inflight_requests.insert(id, reply.clone());
            s.command_queue.push_back(Request { id, method, params });
        }

        match reply.wait_timeout(timeout) {
            Some(result) => result,
            None => {
                self.state.lock().inflight_requests.remove(&id);
                log::debug!("[ELECTRUM] {} (id {}) timed out", method, id);
                Err(FetchError::Timeout)
            }
        }
    }
}

// =====================================================================
// TxFetcher
// =====================================================================

impl TxFetcher for ElectrumFetcher {
    fn fetch_transaction(&self, txid: &Txid, timeout: Duration) -> Result<Bytes, FetchError> {
        log::trace!("[ELECTRUM] fetch_transaction({})", txid);
        let result = self.request(
            "blockchain.transaction.get",
            json!([txid.to_string(), false]),
            timeout,
        )?;
        decode_raw_tx(&result)
    }

    fn send_transaction(&self, raw: &[u8], timeout: Duration) -> Result<(), FetchError> {
        let result = self.request(
            "blockchain.transaction.broadcast",
            json!([hex::encode(raw)]),
            timeout,
        )?;
        log::debug!("[ELECTRUM] broadcast accepted: {}", result);
        Ok(())
    }
}

fn decode_raw_tx(result: &Value) -> Result<Bytes, FetchError> {
    let hex_str = result
        .as_str()
        .ok_or_else(|| FetchError::Rejected("tx result is not a string".into()))?;
    let raw = hex::decode(hex_str).map_err(|e| FetchError::Rejected(format!("bad hex: {}", e)))?;
    Ok(Bytes::from(raw))
}

// =====================================================================
// Async Task
// =====================================================================

type Writer = Pin<Box<dyn AsyncWrite + Send>>;
type Reader = Pin<Box<dyn AsyncRead + Send>>;

struct AsyncElectrumTask {
    writer: Writer,
    state: Arc<Mutex<SharedState>>,
}

impl AsyncElectrumTask {
    /// Establishes the TCP (optionally TLS) connection and sends the version handshake.
    async fn connect(server: &str, state: Arc<Mutex<SharedState>>) -> Result<Self> {
        let (host, port, tls) = parse_server(server)?;
        log::debug!("[ELECTRUM] Connecting to {}:{} (tls={}) ...", host, port, tls);

        let addr: SocketAddr = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no address resolved"))?;
        let tcp = TcpStream::connect(addr).await?;

        let (reader, writer): (Reader, Writer) = if tls {
            let connector = TlsConnector::from(native_tls::TlsConnector::new()?);
            let stream = connector.connect(&host, tcp).await?;
            let (r, w) = tokio::io::split(stream);
            (Box::pin(r), Box::pin(w))
        } else {
            let (r, w) = tokio::io::split(tcp);
            (Box::pin(r), Box::pin(w))
        };

        let reader_state = state.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        log::error!("[ELECTRUM] socket closed");
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = process_message(&line, &reader_state) {
                            log::error!("[ELECTRUM] process_message error: {:?}", e);
                        }
                    }
                    Err(e) => {
                        log::error!("[ELECTRUM] read error: {:?}", e);
                        break;
                    }
                }
            }
            reader_state.lock().fail_all("socket closed");
        });

        let mut this = Self { writer, state };
        this.send(&json!({
            "jsonrpc": "2.0",
            "id": next_id(),
            "method": "server.version",
            "params": ["zeroconf-index", "1.4"]
        }))
        .await?;
        Ok(this)
    }

    /// The main write loop.
    async fn run_forever(&mut self) -> Result<()> {
        loop {
            let requests: Vec<Request> = {
                let mut s = self.state.lock();
                if s.closed.is_some() {
                    return Ok(());
                }
                s.command_queue.drain(..).collect()
            };

            for request in requests {
                self.send(&json!({
                    "jsonrpc": "2.0",
                    "id": request.id,
                    "method": request.method,
                    "params": request.params
                }))
                .await?;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn send(&mut self, v: &Value) -> Result<()> {
        let s = v.to_string();
        log::trace!("[ELECTRUM] Send payload:{}", s);
        self.writer.write_all(s.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// =====================================================================
// Message Processing
// =====================================================================

/// Routes one newline-delimited JSON-RPC message to the caller waiting on its id.
fn process_message(line: &str, state: &Arc<Mutex<SharedState>>) -> Result<()> {
    let msg: Value = serde_json::from_str(line)?;
    log::trace!("[ELECTRUM] process_message line:{}", line.trim());

    // Notifications carry no id and nothing here subscribes.
    let Some(id) = msg.get("id").and_then(|v| v.as_u64()) else {
        return Ok(());
    };

    let reply = state.lock().inflight_requests.remove(&id);
    let Some(reply) = reply else {
        log::debug!("[ELECTRUM] response with unknown id {}", id);
        return Ok(());
    };

    if let Some(err) = msg.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        reply.set(Err(rpc_error(message)));
        return Ok(());
    }

    let result = msg
        .get("result")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("response {} without result", id))?;
    reply.set(Ok(result));
    Ok(())
}

/// Servers answer an unknown txid with an error object, not an empty result.
fn rpc_error(message: String) -> FetchError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no such mempool or blockchain transaction") || lower.contains("not found") {
        FetchError::NotFound(message)
    } else {
        FetchError::Rejected(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(id: u64) -> (Arc<Mutex<SharedState>>, Reply) {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let reply: Reply = Signal::new();
        state.lock().inflight_requests.insert(id, reply.clone());
        (state, reply)
    }

    #[test]
    fn parse_server_strips_scheme() {
        assert_eq!(
            parse_server("ssl://electrum.blockstream.info:60002").unwrap(),
            ("electrum.blockstream.info".to_string(), 60002, true)
        );
        assert_eq!(
            parse_server("tcp://127.0.0.1:50001").unwrap(),
            ("127.0.0.1".to_string(), 50001, false)
        );
        assert!(parse_server("ssl://nohost").is_err());
    }

    #[test]
    fn next_id_increments() {
        let id1 = next_id();
        let id2 = next_id();
        assert!(id2 > id1);
    }

    #[test]
    fn result_is_routed_to_waiting_request() {
        let (state, reply) = state_with(42);
        process_message(r#"{"jsonrpc":"2.0","id":42,"result":"0100"}"#, &state).unwrap();

        let value = reply.peek().unwrap().unwrap();
        assert_eq!(decode_raw_tx(&value).unwrap(), Bytes::from_static(&[0x01, 0x00]));
        assert!(state.lock().inflight_requests.is_empty());
    }

    #[test]
    fn error_response_becomes_rejection() {
        let (state, reply) = state_with(7);
        process_message(
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":1,"message":"missing inputs"}}"#,
            &state,
        )
        .unwrap();

        assert_eq!(
            reply.peek().unwrap(),
            Err(FetchError::Rejected("missing inputs".into()))
        );
    }

    #[test]
    fn unknown_transaction_error_is_not_found() {
        let (state, reply) = state_with(8);
        process_message(
            r#"{"jsonrpc":"2.0","id":8,"error":{"code":2,"message":"daemon error: No such mempool or blockchain transaction. Use gettransaction for wallet transactions."}}"#,
            &state,
        )
        .unwrap();

        assert!(matches!(reply.peek(), Some(Err(FetchError::NotFound(_)))));
    }

    #[test]
    fn closing_fails_inflight_requests() {
        let (state, reply) = state_with(9);
        state.lock().fail_all("socket closed");
        assert!(matches!(reply.peek(), Some(Err(FetchError::Disconnected(_)))));
        assert!(state.lock().closed.is_some());
    }
}
