//! An in-process stand-in for a Tor daemon.
//!
//! [`FakeTor`] serves three things on loopback:
//!
//! - a control port answering `PROTOCOLINFO`, `AUTHENTICATE`, `GETINFO`,
//!   `SETEVENTS` and `SIGNAL`, and emitting scripted `STATUS_CLIENT`
//!   bootstrap events once subscribed;
//! - a SOCKS5 listener that records every CONNECT request and then either
//!   fails it with a scripted reply code, hangs, or tunnels it;
//! - an HTTP origin behind the tunnel that echoes the request as JSON.
//!
//! Origin routes: `/slow` answers after 30 s, `/big` returns 64 KiB, every
//! other path echoes `{method, path, host, authorization, user_agent,
//! body, socks_host}`.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Size of the `/big` response body.
pub const BIG_BODY_LEN: usize = 64 * 1024;

/// Scripted behavior.
#[derive(Debug, Clone)]
pub struct FakeTorOptions {
    /// Progress reported by `GETINFO status/bootstrap-phase`.
    pub initial_progress: u8,
    /// Bootstrap progress events sent after `SETEVENTS`, in order.
    pub steps: Vec<u8>,
    /// Delay before each step.
    pub step_delay: Duration,
    /// Malformed bootstrap lines sent before the first step.
    pub malformed_before: usize,
    /// Whether `GETINFO net/listeners/socks` is answered.
    pub advertise_socks: bool,
    /// SOCKS reply code per target host; unlisted hosts succeed.
    pub socks_replies: HashMap<String, u8>,
    /// Hosts whose CONNECT is accepted but never answered.
    pub hang_hosts: HashSet<String>,
}

impl Default for FakeTorOptions {
    fn default() -> Self {
        Self {
            initial_progress: 0,
            steps: vec![10, 50, 85, 100],
            step_delay: Duration::from_millis(20),
            malformed_before: 0,
            advertise_socks: true,
            socks_replies: HashMap::new(),
            hang_hosts: HashSet::new(),
        }
    }
}

impl FakeTorOptions {
    /// Bootstrap that climbs to `progress` and stays there.
    pub fn stalled_at(progress: u8) -> Self {
        Self {
            steps: vec![5, progress],
            ..Self::default()
        }
    }

    pub fn with_socks_reply(mut self, host: &str, code: u8) -> Self {
        self.socks_replies.insert(host.to_string(), code);
        self
    }

    pub fn with_hang_host(mut self, host: &str) -> Self {
        self.hang_hosts.insert(host.to_string());
        self
    }
}

/// One CONNECT request seen by the SOCKS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRecord {
    pub atyp: u8,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
}

/// SOCKS activity, shared by every fake spawned from one backend.
#[derive(Debug, Default)]
pub struct SocksStats {
    connections: AtomicUsize,
    requests: Mutex<Vec<SocksRecord>>,
}

impl SocksStats {
    /// TCP connections accepted on any SOCKS listener.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SocksRecord> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A running fake daemon. Its listeners close when it is dropped.
pub struct FakeTor {
    pub control_port: u16,
    pub socks_port: u16,
    stats: Arc<SocksStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeTor {
    /// Serve on fresh loopback ports.
    pub async fn bind(options: FakeTorOptions) -> std::io::Result<Self> {
        let control = TcpListener::bind("127.0.0.1:0").await?;
        let socks = TcpListener::bind("127.0.0.1:0").await?;
        Self::serve(control, socks, options, Arc::new(SocksStats::default()))
    }

    /// Serve on already-bound listeners. Must be called inside a runtime.
    pub fn serve(
        control: TcpListener,
        socks: TcpListener,
        options: FakeTorOptions,
        stats: Arc<SocksStats>,
    ) -> std::io::Result<Self> {
        let control_port = control.local_addr()?.port();
        let socks_port = socks.local_addr()?.port();
        let options = Arc::new(options);

        let tasks = vec![
            tokio::spawn(control_loop(control, options.clone(), socks_port)),
            tokio::spawn(socks_loop(socks, options, stats.clone())),
        ];
        Ok(Self {
            control_port,
            socks_port,
            stats,
            tasks,
        })
    }

    pub fn stats(&self) -> &SocksStats {
        &self.stats
    }
}

impl Drop for FakeTor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ── Control port ────────────────────────────────────────────────────────

async fn control_loop(listener: TcpListener, options: Arc<FakeTorOptions>, socks_port: u16) {
    let mut sessions = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
        sessions.push(AbortOnDrop(tokio::spawn(control_session(
            stream,
            options.clone(),
            socks_port,
        ))));
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn control_session(stream: TcpStream, options: Arc<FakeTorOptions>, socks_port: u16) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let _writer = AbortOnDrop(tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if write.write_all(chunk.as_bytes()).await.is_err() {
                break;
            }
        }
    }));
    let mut emitter: Option<AbortOnDrop> = None;

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(command = %line, "fake tor control command");
        let verb = line.split_whitespace().next().unwrap_or_default();
        let reply = match verb {
            "PROTOCOLINFO" => "250-PROTOCOLINFO 1\r\n\
                 250-AUTH METHODS=NULL\r\n\
                 250-VERSION Tor=\"0.4.8.13\"\r\n\
                 250 OK\r\n"
                .to_string(),
            "AUTHENTICATE" => "250 OK\r\n".to_string(),
            "SETEVENTS" => {
                if emitter.is_none() {
                    emitter = Some(AbortOnDrop(tokio::spawn(emit_bootstrap(
                        tx.clone(),
                        options.clone(),
                    ))));
                }
                "250 OK\r\n".to_string()
            }
            "GETINFO" => getinfo(line.trim_start_matches("GETINFO").trim(), &options, socks_port),
            "SIGNAL" => "250 OK\r\n".to_string(),
            "QUIT" => {
                let _ = tx.send("250 closing connection\r\n".to_string());
                break;
            }
            _ => format!("510 Unrecognized command \"{verb}\"\r\n"),
        };
        if tx.send(reply).is_err() {
            break;
        }
    }
}

fn getinfo(key: &str, options: &FakeTorOptions, socks_port: u16) -> String {
    match key {
        "status/bootstrap-phase" => format!(
            "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS={} TAG=starting SUMMARY=\"Starting\"\r\n250 OK\r\n",
            options.initial_progress
        ),
        "net/listeners/socks" if options.advertise_socks => {
            format!("250-net/listeners/socks=\"127.0.0.1:{socks_port}\"\r\n250 OK\r\n")
        }
        "version" => "250-version=0.4.8.13\r\n250 OK\r\n".to_string(),
        _ => format!("552 Unrecognized key \"{key}\"\r\n"),
    }
}

async fn emit_bootstrap(tx: mpsc::UnboundedSender<String>, options: Arc<FakeTorOptions>) {
    for _ in 0..options.malformed_before {
        let _ = tx.send("650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=abc\r\n".to_string());
    }
    for progress in &options.steps {
        tokio::time::sleep(options.step_delay).await;
        let event = format!(
            "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS={progress} TAG=step_{progress} SUMMARY=\"Step {progress}\"\r\n"
        );
        if tx.send(event).is_err() {
            return;
        }
    }
}

// ── SOCKS5 ──────────────────────────────────────────────────────────────

async fn socks_loop(listener: TcpListener, options: Arc<FakeTorOptions>, stats: Arc<SocksStats>) {
    let mut sessions = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
        stats.connections.fetch_add(1, Ordering::SeqCst);
        let options = options.clone();
        let stats = stats.clone();
        sessions.push(AbortOnDrop(tokio::spawn(async move {
            if let Err(e) = socks_session(stream, options, stats).await {
                debug!(error = %e, "fake SOCKS session ended");
            }
        })));
    }
}

const SOCKS_OK: [u8; 10] = [5, 0, 0, 1, 127, 0, 0, 1, 0, 0];

async fn socks_session(
    mut stream: TcpStream,
    options: Arc<FakeTorOptions>,
    stats: Arc<SocksStats>,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let username = if methods.contains(&0x02) {
        stream.write_all(&[5, 0x02]).await?;
        let mut ver_ulen = [0u8; 2];
        stream.read_exact(&mut ver_ulen).await?;
        let mut user = vec![0u8; ver_ulen[1] as usize];
        stream.read_exact(&mut user).await?;
        let plen = stream.read_u8().await?;
        let mut pass = vec![0u8; plen as usize];
        stream.read_exact(&mut pass).await?;
        stream.write_all(&[1, 0]).await?;
        Some(String::from_utf8_lossy(&user).into_owned())
    } else {
        stream.write_all(&[5, 0x00]).await?;
        None
    };

    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    let atyp = req[3];
    let host = match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let port = stream.read_u16().await?;

    stats
        .requests
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(SocksRecord {
            atyp,
            host: host.clone(),
            port,
            username,
        });

    if options.hang_hosts.contains(&host) {
        std::future::pending::<()>().await;
    }
    if let Some(code) = options.socks_replies.get(&host) {
        stream.write_all(&[5, *code, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    }
    stream.write_all(&SOCKS_OK).await?;

    let service = service_fn(move |req| origin(req, host.clone()));
    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
        .map_err(std::io::Error::other)
}

// ── HTTP origin ─────────────────────────────────────────────────────────

async fn origin(
    req: Request<Incoming>,
    socks_host: String,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let host = header("host");
    let authorization = header("authorization");
    let user_agent = header("user-agent");

    match path.as_str() {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return Ok(Response::new(Full::new(Bytes::from_static(b"late"))));
        }
        "/big" => {
            return Ok(Response::new(Full::new(Bytes::from(vec![b'x'; BIG_BODY_LEN]))));
        }
        _ => {}
    }

    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
        .unwrap_or_default();
    let echo = serde_json::json!({
        "method": method,
        "path": path,
        "host": host,
        "authorization": authorization,
        "user_agent": user_agent,
        "body": body,
        "socks_host": socks_host,
    });

    let mut response = Response::new(Full::new(Bytes::from(echo.to_string())));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
