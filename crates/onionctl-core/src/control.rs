//! Tor control-port client.
//!
//! Implements the subset of the line-oriented control protocol the
//! supervisor needs: authentication, `GETINFO`, `SETEVENTS`, `SIGNAL`, and
//! a queue of asynchronous `650` events that arrive between command
//! replies.
//!
//! ```text
//! C: SETEVENTS STATUS_CLIENT
//! S: 250 OK
//! S: 650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=10 TAG=conn_done SUMMARY="Connected to a relay"
//! C: GETINFO net/listeners/socks
//! S: 250-net/listeners/socks="127.0.0.1:9050"
//! S: 250 OK
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use data_encoding::HEXUPPER;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};
use zeroize::Zeroizing;

/// Longest reply line accepted, terminator included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Errors from the control-port client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("failed to connect to control port {port}: {reason}")]
    Connect { port: u16, reason: String },

    #[error("control connection closed")]
    Closed,

    #[error("control connection I/O error: {0}")]
    Io(String),

    #[error("control port rejected command ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("control protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Io(err.to_string())
    }
}

/// Position of a line within a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `NNN-text`, more lines follow.
    Mid,
    /// `NNN+text`, a dot-terminated data block follows.
    Data,
    /// `NNN text`, last line of the reply.
    End,
}

/// One parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    pub kind: LineKind,
    pub text: String,
}

/// A complete reply: status code plus the text of every line. Data blocks
/// are folded into the line that introduced them, separated by `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Asynchronous event notification.
    pub fn is_event(&self) -> bool {
        self.code == 650
    }

    /// Text of the final line (e.g. `OK` or the error message).
    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }
}

/// Parse a single `NNN[-+ ]text` line.
pub fn parse_reply_line(line: &str) -> Result<ReplyLine, ControlError> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(ControlError::Protocol(format!("bad reply line: {line:?}")));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| ControlError::Protocol(format!("bad status code: {line:?}")))?;

    if bytes.len() == 3 {
        return Ok(ReplyLine {
            code,
            kind: LineKind::End,
            text: String::new(),
        });
    }

    let kind = match bytes[3] {
        b'-' => LineKind::Mid,
        b'+' => LineKind::Data,
        b' ' => LineKind::End,
        other => {
            return Err(ControlError::Protocol(format!(
                "bad reply separator {:?} in {line:?}",
                other as char
            )));
        }
    };

    Ok(ReplyLine {
        code,
        kind,
        text: line[4..].to_string(),
    })
}

/// Quote a string for use as a control-protocol argument.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Extract the quoted value of `KEY="..."` from a reply line.
pub fn quoted_value(line: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=\"");
    let start = line.find(&needle)? + needle.len();
    let mut out = String::new();
    let mut chars = line[start..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return Some(out),
            other => out.push(other),
        }
    }
    None
}

/// Credentials presented with `AUTHENTICATE`.
#[derive(Clone)]
pub enum ControlAuth {
    /// No authentication configured on the daemon.
    Null,
    /// Contents of the cookie file, sent hex-encoded.
    Cookie(PathBuf),
    /// `HashedControlPassword` secret.
    Password(Zeroizing<String>),
}

impl std::fmt::Debug for ControlAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlAuth::Null => write!(f, "Null"),
            ControlAuth::Cookie(path) => f.debug_tuple("Cookie").field(path).finish(),
            ControlAuth::Password(_) => write!(f, "Password([REDACTED])"),
        }
    }
}

/// Parsed `PROTOCOLINFO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub auth_methods: Vec<String>,
    pub cookie_file: Option<PathBuf>,
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    pub fn accepts(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn from_reply(reply: &Reply) -> Self {
        let mut info = ProtocolInfo::default();
        for line in &reply.lines {
            if let Some(rest) = line.strip_prefix("AUTH ") {
                if let Some(methods) = rest
                    .split_whitespace()
                    .find_map(|tok| tok.strip_prefix("METHODS="))
                {
                    info.auth_methods = methods.split(',').map(str::to_string).collect();
                }
                info.cookie_file = quoted_value(rest, "COOKIEFILE").map(PathBuf::from);
            } else if let Some(rest) = line.strip_prefix("VERSION ") {
                info.tor_version = quoted_value(rest, "Tor");
            }
        }
        info
    }
}

/// An open connection to a Tor control port.
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    events: VecDeque<Reply>,
}

impl ControlConnection {
    /// Connect to the control port on 127.0.0.1.
    pub async fn connect(port: u16) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| ControlError::Connect {
                port,
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            events: VecDeque::new(),
        })
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(ControlError::Closed);
        }
        if n == MAX_LINE_LEN && buf.last() != Some(&b'\n') {
            return Err(ControlError::Protocol(format!(
                "reply line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        let line = String::from_utf8(buf)
            .map_err(|_| ControlError::Protocol("reply line is not UTF-8".to_string()))?;
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        trace!(line = %trimmed, "control <-");
        Ok(trimmed)
    }

    async fn read_reply(&mut self) -> Result<Reply, ControlError> {
        let mut lines = Vec::new();
        loop {
            let raw = self.read_line().await?;
            let line = parse_reply_line(&raw)?;
            match line.kind {
                LineKind::Mid => lines.push(line.text),
                LineKind::Data => {
                    let mut text = line.text;
                    loop {
                        let data = self.read_line().await?;
                        if data == "." {
                            break;
                        }
                        text.push('\n');
                        // Leading dots are doubled on the wire
                        text.push_str(data.strip_prefix('.').unwrap_or(&data));
                    }
                    lines.push(text);
                }
                LineKind::End => {
                    lines.push(line.text);
                    return Ok(Reply {
                        code: line.code,
                        lines,
                    });
                }
            }
        }
    }

    /// Send a raw command line and return its reply. Events that arrive
    /// before the reply are queued for [`next_event`](Self::next_event).
    pub async fn send(&mut self, command: &str) -> Result<Reply, ControlError> {
        let keyword = command.split_whitespace().next().unwrap_or("");
        debug!(command = keyword, "control ->");

        let line = Zeroizing::new(format!("{command}\r\n"));
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            let reply = self.read_reply().await?;
            if reply.is_event() {
                self.events.push_back(reply);
                continue;
            }
            return Ok(reply);
        }
    }

    /// Like [`send`](Self::send) but a non-2xx reply is an error.
    pub async fn command(&mut self, command: &str) -> Result<Reply, ControlError> {
        let reply = self.send(command).await?;
        if !reply.is_ok() {
            return Err(ControlError::Rejected {
                code: reply.code,
                message: reply.message().to_string(),
            });
        }
        Ok(reply)
    }

    pub async fn protocol_info(&mut self) -> Result<ProtocolInfo, ControlError> {
        let reply = self.command("PROTOCOLINFO 1").await?;
        Ok(ProtocolInfo::from_reply(&reply))
    }

    pub async fn authenticate(&mut self, auth: &ControlAuth) -> Result<(), ControlError> {
        let command = match auth {
            ControlAuth::Null => Zeroizing::new("AUTHENTICATE".to_string()),
            ControlAuth::Cookie(path) => {
                let cookie = Zeroizing::new(tokio::fs::read(path).await.map_err(|e| {
                    ControlError::Io(format!("cannot read cookie {}: {e}", path.display()))
                })?);
                let hex = Zeroizing::new(HEXUPPER.encode(&cookie));
                Zeroizing::new(format!("AUTHENTICATE {}", hex.as_str()))
            }
            ControlAuth::Password(secret) => {
                let quoted = Zeroizing::new(quote(secret));
                Zeroizing::new(format!("AUTHENTICATE {}", quoted.as_str()))
            }
        };
        self.command(&command).await?;
        debug!(method = ?auth, "control port authenticated");
        Ok(())
    }

    /// Authenticate with whatever the daemon advertises: cookie when
    /// offered (using the advertised path, else `fallback_cookie`), null
    /// otherwise.
    pub async fn authenticate_auto(&mut self, fallback_cookie: &Path) -> Result<(), ControlError> {
        let info = self.protocol_info().await?;
        let auth = if info.accepts("COOKIE") {
            ControlAuth::Cookie(
                info.cookie_file
                    .unwrap_or_else(|| fallback_cookie.to_path_buf()),
            )
        } else {
            ControlAuth::Null
        };
        self.authenticate(&auth).await
    }

    /// `GETINFO key`, returning the value for `key`.
    pub async fn get_info(&mut self, key: &str) -> Result<String, ControlError> {
        let reply = self.command(&format!("GETINFO {key}")).await?;
        let prefix = format!("{key}=");
        reply
            .lines
            .iter()
            .find_map(|line| line.strip_prefix(&prefix))
            .map(|value| value.strip_prefix('\n').unwrap_or(value).to_string())
            .ok_or_else(|| ControlError::Protocol(format!("GETINFO reply lacks {key}")))
    }

    pub async fn set_events(&mut self, events: &[&str]) -> Result<(), ControlError> {
        self.command(&format!("SETEVENTS {}", events.join(" ")))
            .await
            .map(|_| ())
    }

    pub async fn signal(&mut self, name: &str) -> Result<(), ControlError> {
        self.command(&format!("SIGNAL {name}")).await.map(|_| ())
    }

    /// Next asynchronous event, waiting for one if none is queued.
    pub async fn next_event(&mut self) -> Result<Reply, ControlError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        let reply = self.read_reply().await?;
        if !reply.is_event() {
            return Err(ControlError::Protocol(format!(
                "unsolicited {} reply: {}",
                reply.code,
                reply.message()
            )));
        }
        Ok(reply)
    }
}
