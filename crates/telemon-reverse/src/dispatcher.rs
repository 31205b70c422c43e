//! Maps broker REQUEST frames onto the agent's local metrics endpoint.
//!
//! The payload of a REQUEST frame is an HTTP/1.1-style request (request
//! line plus headers). The dispatcher replays it against the local
//! endpoint, then streams the serialized response back as REQUEST frames
//! carrying the same sequence id, ending with a zero-length terminator.
//! Local failures become synthetic gateway responses; they never terminate
//! the connection.

use crate::codec::{Command, Frame};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// Response bytes per frame. Stays well under the REQUEST payload cap.
pub const RESPONSE_CHUNK: usize = 64 * 1024;

pub struct Dispatcher {
    client: reqwest::Client,
    agent_address: String,
    timeout: Duration,
}

struct LocalRequest {
    method: reqwest::Method,
    path: String,
    headers: Vec<(String, String)>,
}

impl Dispatcher {
    /// `agent_address` is the `host:port` of the agent's own metrics
    /// endpoint; every forwarded request goes there, regardless of what
    /// host the broker named.
    pub fn new(agent_address: String, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            agent_address,
            timeout,
        })
    }

    /// Forward one REQUEST payload and stream the response frames into
    /// `tx`. Returns `false` when a synthetic gateway response was emitted
    /// instead of a real one.
    pub async fn dispatch(&self, seq: u32, payload: &[u8], tx: &mpsc::Sender<Frame>) -> bool {
        let request = match parse_request(payload) {
            Some(r) => r,
            None => {
                tracing::debug!(seq, "unparseable request payload");
                self.send_response(seq, synthetic(400, "Bad Request", "unparseable request"), tx)
                    .await;
                return false;
            }
        };

        let url = format!("http://{}{}", self.agent_address, request.path);
        let mut builder = self.client.request(request.method.clone(), url);
        for (name, value) in &request.headers {
            // The local endpoint is the real host; drop whatever the broker named.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let outcome = tokio::time::timeout(self.timeout, async {
            let resp = builder.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        })
        .await;

        match outcome {
            Ok(Ok((status, headers, body))) => {
                tracing::debug!(seq, status = status.as_u16(), path = %request.path, "dispatched");
                let mut response = Vec::with_capacity(body.len() + 256);
                response.extend_from_slice(
                    format!(
                        "HTTP/1.1 {} {}\r\n",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("")
                    )
                    .as_bytes(),
                );
                for (name, value) in headers.iter() {
                    // The body is re-framed below; its length headers are ours.
                    if name == reqwest::header::TRANSFER_ENCODING
                        || name == reqwest::header::CONTENT_LENGTH
                    {
                        continue;
                    }
                    response.extend_from_slice(name.as_str().as_bytes());
                    response.extend_from_slice(b": ");
                    response.extend_from_slice(value.as_bytes());
                    response.extend_from_slice(b"\r\n");
                }
                response.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
                response.extend_from_slice(b"\r\n");
                response.extend_from_slice(&body);
                self.send_response(seq, response, tx).await;
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(seq, path = %request.path, error = %e, "local endpoint failed");
                self.send_response(seq, synthetic(502, "Bad Gateway", &e.to_string()), tx)
                    .await;
                false
            }
            Err(_) => {
                tracing::warn!(
                    seq,
                    path = %request.path,
                    timeout_secs = self.timeout.as_secs(),
                    "local dispatch timed out"
                );
                self.send_response(
                    seq,
                    synthetic(504, "Gateway Timeout", "local endpoint did not answer in time"),
                    tx,
                )
                .await;
                false
            }
        }
    }

    /// Chunk the serialized response into REQUEST frames and terminate with
    /// a zero-length frame. Send failures mean the writer is gone; nothing
    /// to do about it here.
    async fn send_response(&self, seq: u32, response: Vec<u8>, tx: &mpsc::Sender<Frame>) {
        let response = Bytes::from(response);
        let mut offset = 0usize;
        while offset < response.len() {
            let end = (offset + RESPONSE_CHUNK).min(response.len());
            let frame = Frame::new(seq, Command::Request, response.slice(offset..end));
            if tx.send(frame).await.is_err() {
                return;
            }
            offset = end;
        }
        let _ = tx.send(Frame::empty(seq, Command::Request)).await;
    }
}

/// Parse `METHOD /path [HTTP/x.y]` plus `Name: value` header lines.
/// Tolerates bare request lines and either line ending.
fn parse_request(payload: &[u8]) -> Option<LocalRequest> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));

    let request_line = lines.next()?.trim();
    let mut parts = request_line.split_ascii_whitespace();
    let method = reqwest::Method::from_bytes(parts.next()?.as_bytes()).ok()?;
    let path = parts.next()?;
    if !path.starts_with('/') {
        return None;
    }

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some(LocalRequest {
        method,
        path: path.to_string(),
        headers,
    })
}

fn synthetic(code: u16, reason: &str, message: &str) -> Vec<u8> {
    let body = message.as_bytes();
    let mut response = Vec::with_capacity(body.len() + 128);
    response.extend_from_slice(
        format!(
            "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    response.extend_from_slice(body);
    response
}
