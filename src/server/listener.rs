use crate::config::{ListenerConfig, PayloadEncoding};
use crate::core::{Result, SignalError, format_timestamp, local_now};
use crate::ingest::IngestBridge;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

const READ_CHUNK: usize = 4096;
const MAX_PAYLOAD: usize = 64 * 1024;
/// A peer that goes quiet this long after sending is done talking.
const IDLE_AFTER_DATA: Duration = Duration::from_millis(100);
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decodes a received payload.
pub fn decode_payload(bytes: &[u8], encoding: PayloadEncoding) -> String {
    match encoding {
        PayloadEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        PayloadEncoding::Ascii => bytes
            .iter()
            .map(|b| if b.is_ascii() { *b as char } else { '?' })
            .collect(),
    }
}

/// Turns a payload into ingestion lines stamped with the receive time.
///
/// Each further line of the same payload is stamped one millisecond later,
/// so lines from one client never share a record key.
pub fn stamp_lines(payload: &str, received: NaiveDateTime) -> Vec<String> {
    payload
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .zip(0i64..)
        .map(|(line, index)| {
            let stamp = received + TimeDelta::milliseconds(index);
            format!("{}\t{}", format_timestamp(&stamp), line)
        })
        .collect()
}

/// HTTP-style reply sent back to every peer.
pub fn response_frame(body: &str) -> String {
    let header = [
        "HTTP/1.1 200 OK".to_string(),
        "Server: sigrelay".to_string(),
        format!("Date: {}", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")),
        format!("Content-Length: {}", body.len()),
        "Content-Type: text/xml; charset=UTF-8".to_string(),
    ];
    format!("{}\r\n\r\n{}", header.join("\r\n"), body)
}

#[derive(Debug, Default)]
struct ListenerMetrics {
    connections: AtomicU64,
}

/// Accepts peers, hands their lines to the bridge and answers with the
/// bridge's current response.
pub struct SignalListener {
    listener: TcpListener,
    bridge: IngestBridge,
    encoding: PayloadEncoding,
    metrics: Arc<ListenerMetrics>,
}

impl SignalListener {
    pub async fn bind(config: &ListenerConfig, bridge: IngestBridge) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SignalError::IoError(format!("bind {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            bridge,
            encoding: config.encoding,
            metrics: Arc::new(ListenerMetrics::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            event!(Level::INFO, addr = %addr, "signal listener started");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let count = self.metrics.connections.fetch_add(1, Ordering::Relaxed) + 1;
                            if count % 1000 == 0 {
                                event!(Level::INFO, connections = count, "signal connections accepted");
                            }
                            let bridge = self.bridge.clone();
                            let encoding = self.encoding;
                            tokio::spawn(async move {
                                if let Err(err) = handle_peer(socket, bridge, encoding).await {
                                    event!(Level::WARN, peer = %peer, error = %err, "peer connection failed");
                                }
                            });
                        }
                        Err(err) => {
                            event!(Level::ERROR, error = %err, "accept failed");
                        }
                    }
                }
            }
        }
        event!(Level::INFO, "signal listener stopped");
    }
}

async fn read_payload(socket: &mut TcpStream) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let wait = if payload.is_empty() {
            FIRST_BYTE_TIMEOUT
        } else {
            IDLE_AFTER_DATA
        };
        match timeout(wait, socket.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                payload.extend_from_slice(&chunk[..n]);
                if payload.len() >= MAX_PAYLOAD {
                    break;
                }
            }
            Ok(Err(err)) => return Err(err.into()),
        }
    }
    Ok(payload)
}

async fn handle_peer(
    mut socket: TcpStream,
    bridge: IngestBridge,
    encoding: PayloadEncoding,
) -> Result<()> {
    let payload = read_payload(&mut socket).await?;
    let received = local_now();
    let text = decode_payload(&payload, encoding);

    for line in stamp_lines(&text, received) {
        bridge.submit_evicting(line).await?;
    }

    socket
        .write_all(response_frame(&bridge.response()).as_bytes())
        .await?;
    socket.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::parse_timestamp;

    #[test]
    fn test_stamp_lines() {
        let received = parse_timestamp("2024/01/01 10:00:00.000").unwrap();
        let lines = stamp_lines("Press1\tOK\tAll Clear\r\n\r\nPress2\tNG\tJam", received);
        assert_eq!(
            lines,
            vec![
                "2024/01/01 10:00:00.000\tPress1\tOK\tAll Clear".to_string(),
                "2024/01/01 10:00:00.001\tPress2\tNG\tJam".to_string(),
            ]
        );
    }

    #[test]
    fn test_stamp_lines_single_line_keeps_receive_time() {
        let received = parse_timestamp("2024/01/01 10:00:00.999").unwrap();
        assert_eq!(
            stamp_lines("Press1\tNG\tJam\r\n", received),
            vec!["2024/01/01 10:00:00.999\tPress1\tNG\tJam".to_string()]
        );
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload("Presse\u{e9}".as_bytes(), PayloadEncoding::Utf8), "Presse\u{e9}");
        assert_eq!(decode_payload("Presse\u{e9}".as_bytes(), PayloadEncoding::Ascii), "Presse??");
    }

    #[test]
    fn test_response_frame() {
        let frame = response_frame("DatabaseLocked");
        assert!(frame.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(frame.contains("Content-Length: 14\r\n"));
        assert!(frame.ends_with("\r\n\r\nDatabaseLocked"));
    }
}
