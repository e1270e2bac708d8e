#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

pub const HELLO: &str = r"\documentclass{article}\begin{document}Hello\end{document}";

/// Stands in for `docker run ... latexmk`. Writes main.pdf, main.log and
/// main.synctex into the mounted directory, or a TeX error log when the main
/// file contains `\FAIL`.
pub const FAKE_CONTAINER: &str = r#"#!/bin/sh
dir=""
last=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-v" ]; then
    dir="${2%%:/workdir}"
    shift
  fi
  last="$1"
  shift
done
stem="${last%.tex}"
if grep -q 'FAIL' "$dir/$last"; then
  printf '%s\n' "./$last:3: Undefined control sequence." \
    "! Undefined control sequence." "l.3 \\FAIL" > "$dir/$stem.log"
  echo "latexmk: errors" >&2
  exit 12
fi
printf '%%PDF-1.4\n1 0 obj << /Type /Page >> endobj\n%%%%EOF\n' > "$dir/$stem.pdf"
echo "Output written on $stem.pdf (1 page)." > "$dir/$stem.log"
printf 'Input:1:/workdir/./%s\n{1\nx1,3:4736286,7340032\n}1\n' "$last" > "$dir/$stem.synctex"
exit 0
"#;

/// Writes an executable shell script into `dir`.
#[cfg(unix)]
pub async fn create_dummy_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    tokio::fs::write(&path, script).await.expect("write dummy executable");
    let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&path, perms).await.expect("chmod dummy executable");
    path
}

#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl CannedResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
            delay: Duration::ZERO,
        }
    }

    pub fn pdf(body: &[u8]) -> Self {
        Self {
            status: 200,
            content_type: "application/pdf",
            body: body.to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    /// Lower-cased header block.
    pub headers: String,
    pub body: String,
}

/// Loopback HTTP server answering every request with `response`.
pub async fn serve(response: CannedResponse) -> (String, Arc<Mutex<Vec<RecordedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&recorded);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let response = response.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let _ = answer(socket, response, seen).await;
            });
        }
    });

    (url, recorded)
}

/// URL of a port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}

async fn answer(
    mut socket: TcpStream,
    response: CannedResponse,
    seen: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let request = read_request(&mut socket).await?;
    seen.lock().unwrap().push(request);

    tokio::time::sleep(response.delay).await;

    let reason = match response.status {
        200 => "OK",
        400 => "Bad Request",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        response.status,
        reason,
        response.content_type,
        response.body.len()
    );
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(&response.body).await?;
    socket.shutdown().await
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    Ok(RecordedRequest {
        request_line,
        headers: lines.collect::<Vec<_>>().join("\n"),
        body: String::from_utf8_lossy(&buffer[header_end..]).to_string(),
    })
}
