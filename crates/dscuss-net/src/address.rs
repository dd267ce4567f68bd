//! Address providers: sources of candidate `host:port` strings for the
//! dial loop.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What an address provider reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEvent {
    Address(String),
    /// An input that is neither `DOMAIN:PORT` nor `IPv4:PORT`.
    ParseError { input: String, reason: String },
    IoError(String),
}

/// A source of peer addresses.
///
/// The consumer is registered before `start`; providers spawn their own
/// tasks and must stop them in `stop`.
pub trait AddressProvider: Send {
    fn register(&mut self, sink: mpsc::Sender<AddressEvent>);
    fn start(&mut self);
    fn stop(&mut self);
}

/// Check `input` against `DOMAIN:PORT` or `IPv4:PORT` and return its
/// normalised form.
pub fn validate_address(input: &str) -> Result<String, String> {
    let input = input.trim();
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| "missing port".to_string())?;
    let port: u16 = port.parse().map_err(|_| format!("bad port '{port}'"))?;
    if port == 0 {
        return Err("port 0".into());
    }
    if host.parse::<Ipv4Addr>().is_ok() || is_valid_domain(host) {
        Ok(format!("{}:{port}", host.to_ascii_lowercase()))
    } else {
        Err(format!("bad host '{host}'"))
    }
}

fn is_valid_domain(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    // A dotted quad that failed to parse as IPv4 is not a domain either.
    if host.split('.').all(|l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit())) {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Validate each line of `content`, skipping blanks and `#` comments.
pub fn parse_address_lines(content: &str) -> Vec<AddressEvent> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match validate_address(line) {
            Ok(addr) => AddressEvent::Address(addr),
            Err(reason) => AddressEvent::ParseError {
                input: line.to_string(),
                reason,
            },
        })
        .collect()
}

async fn emit_all(sink: &mpsc::Sender<AddressEvent>, events: Vec<AddressEvent>) {
    for event in events {
        if sink.send(event).await.is_err() {
            return;
        }
    }
}

/// Emits a fixed list once.
pub struct StaticAddressProvider {
    addresses: Vec<String>,
    sink: Option<mpsc::Sender<AddressEvent>>,
    task: Option<JoinHandle<()>>,
}

impl StaticAddressProvider {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            sink: None,
            task: None,
        }
    }
}

impl AddressProvider for StaticAddressProvider {
    fn register(&mut self, sink: mpsc::Sender<AddressEvent>) {
        self.sink = Some(sink);
    }

    fn start(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let events = parse_address_lines(&self.addresses.join("\n"));
        self.task = Some(tokio::spawn(async move { emit_all(&sink, events).await }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Reads one address per line from a file.
pub struct FileAddressProvider {
    path: PathBuf,
    sink: Option<mpsc::Sender<AddressEvent>>,
    task: Option<JoinHandle<()>>,
}

impl FileAddressProvider {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            sink: None,
            task: None,
        }
    }
}

impl AddressProvider for FileAddressProvider {
    fn register(&mut self, sink: mpsc::Sender<AddressEvent>) {
        self.sink = Some(sink);
    }

    fn start(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let path = self.path.clone();
        self.task = Some(tokio::spawn(async move {
            let events = match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let events = parse_address_lines(&content);
                    tracing::info!(path = %path.display(), count = events.len(), "loaded address list");
                    events
                }
                Err(e) => vec![AddressEvent::IoError(format!("{}: {e}", path.display()))],
            };
            emit_all(&sink, events).await;
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
