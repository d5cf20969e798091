//! Scriptable in-process provider and a canned HTTP responder for unit tests.

use crate::error::{Error, FetchError, Result};
use crate::message::{Message, MessageId};
use crate::providers::{CreatedMailbox, ProviderAdapter, ProviderKey};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use secrecy::SecretString;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

type FetchResult = std::result::Result<Vec<Message>, FetchError>;

pub(crate) struct FakeProvider {
    key: ProviderKey,
    domain: String,
    alive: AtomicBool,
    panic_on_liveness: AtomicBool,
    liveness_delay: Mutex<Option<Duration>>,
    fetch_delay: Mutex<Option<Duration>>,
    create_delay: Mutex<Option<Duration>>,
    create_calls: Mutex<Vec<String>>,
    scripted: Mutex<VecDeque<FetchResult>>,
    fallback: Mutex<FetchResult>,
    remote_taken: Mutex<HashSet<String>>,
    fetch_calls: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn new(key: ProviderKey, domain: &str) -> Arc<Self> {
        Arc::new(Self {
            key,
            domain: domain.to_string(),
            alive: AtomicBool::new(true),
            panic_on_liveness: AtomicBool::new(false),
            liveness_delay: Mutex::new(None),
            fetch_delay: Mutex::new(None),
            create_delay: Mutex::new(None),
            create_calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(Vec::new())),
            remote_taken: Mutex::new(HashSet::new()),
            fetch_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub(crate) fn set_panic_on_liveness(&self, panic: bool) {
        self.panic_on_liveness.store(panic, Ordering::SeqCst);
    }

    pub(crate) fn set_liveness_delay(&self, delay: Duration) {
        *self.liveness_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock().unwrap() = delay;
    }

    /// Prefixes passed to `create_email`, in call order.
    pub(crate) fn create_calls(&self) -> Vec<String> {
        self.create_calls.lock().unwrap().clone()
    }

    /// Result returned once, before the fallback.
    pub(crate) fn push_fetch(&self, result: FetchResult) {
        self.scripted.lock().unwrap().push_back(result);
    }

    /// Result returned whenever nothing is scripted.
    pub(crate) fn set_fallback(&self, result: FetchResult) {
        *self.fallback.lock().unwrap() = result;
    }

    /// Makes remote creation of `prefix` fail with `PrefixTaken`.
    pub(crate) fn take_remote(&self, prefix: &str) {
        self.remote_taken.lock().unwrap().insert(prefix.to_string());
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// A message dated `minute` minutes after a fixed base time.
    pub(crate) fn message(&self, native: &str, minute: u32, text: &str) -> Message {
        Message {
            id: MessageId::new(self.key.clone(), native),
            from: "sender@example.com".into(),
            subject: format!("message {native}"),
            date: Utc.with_ymd_and_hms(2025, 1, 1, 12, minute, 0).unwrap(),
            text: text.into(),
            html: String::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    fn key(&self) -> ProviderKey {
        self.key.clone()
    }

    fn display_name(&self) -> &str {
        "Fake"
    }

    fn domains(&self) -> Vec<String> {
        vec![self.domain.clone()]
    }

    async fn create_email(&self, desired_prefix: Option<&str>) -> Result<CreatedMailbox> {
        let prefix = desired_prefix.unwrap_or("fake").to_string();
        self.create_calls.lock().unwrap().push(prefix.clone());
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.remote_taken.lock().unwrap().contains(&prefix) {
            return Err(Error::PrefixTaken {
                prefix,
                provider: self.key.clone(),
            });
        }
        Ok(CreatedMailbox::new(
            &prefix,
            &self.domain,
            SecretString::from(format!("token-{prefix}")),
        ))
    }

    async fn fetch_messages(&self, _credential: &SecretString, _address: &str) -> FetchResult {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }

    async fn check_liveness(&self) -> bool {
        let delay = *self.liveness_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        assert!(
            !self.panic_on_liveness.load(Ordering::SeqCst),
            "liveness probe exploded"
        );
        self.alive.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Canned HTTP responder
// ─────────────────────────────────────────────────────────────────────────────

/// Client for talking to a [`StubServer`], ignoring any system proxy.
pub(crate) fn local_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// One canned response, served to every request whose head contains `needle`.
#[derive(Debug, Clone)]
pub(crate) struct StubRoute {
    needle: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl StubRoute {
    pub(crate) fn new(needle: &str, status: u16, body: &str) -> Self {
        Self {
            needle: needle.to_string(),
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub(crate) fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// HTTP/1.1 server on a loopback port answering from a fixed route table.
///
/// Routes are matched in order against the request line; unmatched requests
/// get an empty 404. Every connection is closed after one response.
pub(crate) struct StubServer {
    addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub(crate) async fn start(routes: Vec<StubRoute>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = respond(stream, &routes, &log).await;
                });
            }
        });

        Self { addr, requests, task }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Raw requests received so far, in arrival order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(
    mut stream: TcpStream,
    routes: &[StubRoute],
    log: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request_line = head.lines().next().unwrap_or_default().to_string();
    log.lock().unwrap().push(String::from_utf8_lossy(&buf).into_owned());

    let route = routes.iter().find(|r| request_line.contains(&r.needle));
    let (status, headers, body) = match route {
        Some(r) => (r.status, r.headers.clone(), r.body.clone()),
        None => (404, Vec::new(), String::new()),
    };

    let mut response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(&body);

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
