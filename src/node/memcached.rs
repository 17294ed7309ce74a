//! Memcached Node
//!
//! Minimal memcached ASCII protocol client for one server.
//!
//! # Protocol subset
//!
//! ```text
//! get <key>\r\n                          → VALUE <key> <flags> <len>\r\n<data>\r\nEND\r\n | END\r\n
//! set <key> 0 <ttl> <len>\r\n<data>\r\n  → STORED | NOT_STORED
//! delete <key>\r\n                       → DELETED | NOT_FOUND
//! flush_all\r\n                          → OK
//! stats\r\n                              → STAT <name> <value>\r\n ... END\r\n
//! ```
//!
//! Requests are serialised over a single connection. The connection is opened
//! lazily and dropped after any I/O or protocol failure. A request abandoned
//! mid-flight (the caller's timeout fired) leaves the connection marked dirty,
//! and the next request reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Endpoint, NodeClient, NodeConnector, NodeError, NodeResult, NodeStats};

/// Longest key memcached accepts
pub const MAX_KEY_LENGTH: usize = 250;

struct Connection {
    stream: BufStream<TcpStream>,
    clean: bool,
}

#[derive(Debug, Clone, Copy)]
enum Expect {
    Line,
    Value,
    Stats,
}

#[derive(Debug)]
enum Reply {
    Line(String),
    Value(Option<Bytes>),
    Stats(NodeStats),
}

/// Memcached server reached over TCP
pub struct MemcachedNode {
    endpoint: Endpoint,
    connect_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl MemcachedNode {
    /// Create a client; no connection is opened until the first request
    pub fn new(endpoint: Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            conn: Mutex::new(None),
        }
    }

    async fn open(&self) -> NodeResult<Connection> {
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::Timeout(self.connect_timeout))?
            .map_err(|e| self.connection_error(e))?;
        stream.set_nodelay(true).map_err(|e| self.connection_error(e))?;

        debug!(endpoint = %self.endpoint, "Connected to memcached");
        Ok(Connection {
            stream: BufStream::new(stream),
            clean: true,
        })
    }

    async fn request(&self, command: Vec<u8>, expect: Expect) -> NodeResult<Reply> {
        let mut guard = self.conn.lock().await;
        if !guard.as_ref().is_some_and(|c| c.clean) {
            *guard = Some(self.open().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(NodeError::Protocol("connection unavailable".to_string()));
        };

        conn.clean = false;
        match self.exchange(&mut conn.stream, &command, expect).await {
            Ok(reply) => {
                conn.clean = true;
                Ok(reply)
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        stream: &mut BufStream<TcpStream>,
        command: &[u8],
        expect: Expect,
    ) -> NodeResult<Reply> {
        stream
            .write_all(command)
            .await
            .map_err(|e| self.connection_error(e))?;
        stream.flush().await.map_err(|e| self.connection_error(e))?;

        match expect {
            Expect::Line => Ok(Reply::Line(self.read_line(stream).await?)),
            Expect::Value => {
                let header = self.read_line(stream).await?;
                if header == "END" {
                    return Ok(Reply::Value(None));
                }
                let len = parse_value_header(&header)?;

                let mut data = vec![0u8; len + 2];
                stream
                    .read_exact(&mut data)
                    .await
                    .map_err(|e| self.connection_error(e))?;
                if !data.ends_with(b"\r\n") {
                    return Err(NodeError::Protocol(
                        "value block not terminated by CRLF".to_string(),
                    ));
                }
                data.truncate(len);

                let end = self.read_line(stream).await?;
                if end != "END" {
                    return Err(NodeError::Protocol(format!(
                        "expected END after value, got '{}'",
                        end
                    )));
                }
                Ok(Reply::Value(Some(Bytes::from(data))))
            }
            Expect::Stats => {
                let mut stats = NodeStats::new();
                loop {
                    let line = self.read_line(stream).await?;
                    if line == "END" {
                        break;
                    }
                    let mut parts = line.splitn(3, ' ');
                    match (parts.next(), parts.next(), parts.next()) {
                        (Some("STAT"), Some(name), Some(value)) => {
                            stats.insert(name.to_string(), value.to_string());
                        }
                        _ => return Err(error_line(&line)),
                    }
                }
                Ok(Reply::Stats(stats))
            }
        }
    }

    async fn read_line(&self, stream: &mut BufStream<TcpStream>) -> NodeResult<String> {
        let mut line = String::new();
        let read = stream
            .read_line(&mut line)
            .await
            .map_err(|e| self.connection_error(e))?;
        if read == 0 {
            return Err(NodeError::Connection {
                endpoint: self.endpoint.to_string(),
                reason: "connection closed by server".to_string(),
            });
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn connection_error(&self, e: std::io::Error) -> NodeError {
        NodeError::Connection {
            endpoint: self.endpoint.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl NodeClient for MemcachedNode {
    fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }

    async fn get(&self, key: &str) -> NodeResult<Bytes> {
        validate_key(key)?;
        match self
            .request(format!("get {}\r\n", key).into_bytes(), Expect::Value)
            .await?
        {
            Reply::Value(Some(data)) => Ok(data),
            Reply::Value(None) => Err(NodeError::NotFound),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: u32) -> NodeResult<()> {
        validate_key(key)?;
        let mut command = format!("set {} 0 {} {}\r\n", key, ttl, value.len()).into_bytes();
        command.extend_from_slice(&value);
        command.extend_from_slice(b"\r\n");

        match self.request(command, Expect::Line).await? {
            Reply::Line(line) if line == "STORED" => Ok(()),
            Reply::Line(line) if line == "NOT_STORED" => Err(NodeError::NotStored),
            Reply::Line(line) => Err(error_line(&line)),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> NodeResult<()> {
        validate_key(key)?;
        match self
            .request(format!("delete {}\r\n", key).into_bytes(), Expect::Line)
            .await?
        {
            Reply::Line(line) if line == "DELETED" => Ok(()),
            Reply::Line(line) if line == "NOT_FOUND" => Err(NodeError::NotFound),
            Reply::Line(line) => Err(error_line(&line)),
            other => Err(unexpected(other)),
        }
    }

    async fn flush(&self) -> NodeResult<()> {
        match self.request(b"flush_all\r\n".to_vec(), Expect::Line).await? {
            Reply::Line(line) if line == "OK" => Ok(()),
            Reply::Line(line) => Err(error_line(&line)),
            other => Err(unexpected(other)),
        }
    }

    async fn stats(&self) -> NodeResult<NodeStats> {
        match self.request(b"stats\r\n".to_vec(), Expect::Stats).await? {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }
}

/// Connector creating memcached TCP clients
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl NodeConnector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Arc<dyn NodeClient> {
        Arc::new(MemcachedNode::new(endpoint.clone(), timeout))
    }
}

fn validate_key(key: &str) -> NodeResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(NodeError::Protocol(format!(
            "key length {} outside 1..={}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(NodeError::Protocol(
            "key contains whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

fn parse_value_header(header: &str) -> NodeResult<usize> {
    let parts: Vec<&str> = header.split(' ').collect();
    match parts.as_slice() {
        ["VALUE", _key, _flags, len, ..] => len
            .parse::<usize>()
            .map_err(|_| NodeError::Protocol(format!("bad value length in '{}'", header))),
        _ => Err(error_line(header)),
    }
}

fn error_line(line: &str) -> NodeError {
    NodeError::Protocol(format!("unexpected reply '{}'", line))
}

fn unexpected(reply: Reply) -> NodeError {
    NodeError::Protocol(format!("unexpected reply {:?}", reply))
}

// =============================================================================
// Tests
// =============================================================================
