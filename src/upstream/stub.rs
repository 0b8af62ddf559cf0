//! Minimal HTTP/1.1 upstream on 127.0.0.1 for transport tests.
//!
//! One request per connection. Responses always close the connection, so
//! bodies without a length (event streams) end when the stub drops them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct StubRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    /// `body.type` of a wire envelope (`initialize` or `callTool`).
    pub fn envelope_type(&self) -> String {
        self.json()["body"]["type"].as_str().unwrap_or_default().to_string()
    }
}

/// How the stub answers one POST.
pub enum StubReply {
    Respond {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    /// Hold the connection open without answering.
    Hang,
}

impl StubReply {
    pub fn json(status: u16, body: Value) -> Self {
        StubReply::Respond {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        StubReply::Respond {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }
}

pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    (listener, base)
}

/// Read one request: head up to the blank line, then `Content-Length` bytes.
pub async fn read_request(stream: &mut TcpStream) -> Option<StubRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(StubRequest {
        method,
        path,
        headers,
        body,
    })
}

pub async fn write_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Write the head of an open-ended `text/event-stream` response.
pub async fn write_event_stream_head(stream: &mut TcpStream) {
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
    let _ = stream.write_all(head.as_bytes()).await;
}

pub async fn write_event(stream: &mut TcpStream, event: &str, data: &str) {
    let frame = format!("event: {event}\ndata: {data}\n\n");
    let _ = stream.write_all(frame.as_bytes()).await;
    let _ = stream.flush().await;
}

/// A POST-only upstream answering every request through `reply`.
pub struct HttpStub {
    pub url: String,
    /// Connections held open by [`StubReply::Hang`] that the client has not
    /// closed yet.
    hanging: Arc<AtomicUsize>,
}

impl HttpStub {
    pub async fn start(reply: impl Fn(&StubRequest) -> StubReply + Send + Sync + 'static) -> Self {
        let (listener, base) = bind().await;
        let reply = Arc::new(reply);
        let hanging = Arc::new(AtomicUsize::new(0));

        let open = Arc::clone(&hanging);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let reply = Arc::clone(&reply);
                let open = Arc::clone(&open);
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut stream).await else {
                        return;
                    };
                    match reply(&request) {
                        StubReply::Respond {
                            status,
                            content_type,
                            body,
                        } => write_response(&mut stream, status, content_type, &body).await,
                        StubReply::Hang => {
                            open.fetch_add(1, Ordering::SeqCst);
                            let mut sink = [0u8; 256];
                            while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                            open.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        Self {
            url: format!("{base}/mcp"),
            hanging,
        }
    }

    pub fn hanging(&self) -> usize {
        self.hanging.load(Ordering::SeqCst)
    }
}
