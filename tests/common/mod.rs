//! Loopback TCP stand-in for an SCPI instrument.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Reply sent to `SYST:ERR?` and any other unrecognized query
pub const NO_ERROR: &str = "+0,\"No error\"";

/// One line as seen by the mock instrument.
#[derive(Debug, Clone)]
pub struct Received {
    pub line: String,
    pub at: Instant,
}

/// Accepts a single connection, records every line, answers every query.
pub struct MockInstrument {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
    handle: JoinHandle<()>,
}

impl MockInstrument {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// `on_line` runs for every received line before the reply goes out.
    pub async fn spawn_with<F>(mut on_line: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        let handle = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = conn.into_split();
            let mut lines = BufReader::new(read_half).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                log.lock().unwrap().push(Received {
                    line: line.clone(),
                    at: Instant::now(),
                });
                on_line(&line);

                if line.ends_with('?') {
                    let reply = format!("{}\n", reply_to(&line));
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            received,
            handle,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop listening without waiting for a client.
    pub fn abort(self) {
        self.handle.abort();
    }

    /// Lines received so far.
    pub fn lines(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.line.clone())
            .collect()
    }

    /// Wait for the client to close the connection, then return everything received.
    pub async fn finish(self) -> Vec<Received> {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.handle)
            .await
            .expect("client never closed the connection")
            .unwrap();
        let received = self.received.lock().unwrap();
        received.clone()
    }
}

fn reply_to(query: &str) -> String {
    match query {
        "*IDN?" => "MOCK,33500B,0,1.0".to_string(),
        "*OPC?" => "1".to_string(),
        _ => NO_ERROR.to_string(),
    }
}
