#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use login_agent::{
    CaptchaImage, CaptchaReader, ControllerConfig, CredentialSubmitter, Credentials, ErrorKind,
    LoginAttempt, LoginAttemptController, Session, SessionBroker, SubmitReply,
};
use recognition::{ConsensusBasis, ConsensusResult, SolveReport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn creds() -> Credentials {
    Credentials::new("alice", "hunter2")
}

// ── Mock HTTP backend ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.body
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json_status(status: &str) -> Self {
        Self::ok(format!("{{\"status\":\"{status}\"}}"))
            .with_header("Content-Type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} Mock\r\n", self.status);
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Responder gets the request and how many earlier requests hit the same path.
type Responder = Arc<dyn Fn(&RecordedRequest, usize) -> MockResponse + Send + Sync>;

pub struct MockBackend {
    pub port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockBackend {
    pub async fn spawn(
        responder: impl Fn(&RecordedRequest, usize) -> MockResponse + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(responder);

        let log = requests.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    let log = log.clone();
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        handle(socket, log, responder).await;
                    });
                }
            }
        });

        Self { port, requests }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle(
    mut socket: TcpStream,
    log: Arc<Mutex<Vec<RecordedRequest>>>,
    responder: Responder,
) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    let response = {
        let mut log = log.lock().unwrap();
        let seen = log.iter().filter(|r| r.path == request.path).count();
        log.push(request.clone());
        responder(&request, seen)
    };
    let _ = socket.write_all(&response.to_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(body_start + content_length);
    let body = String::from_utf8_lossy(&buf[body_start..body_end]).to_string();

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ── Scripted fakes ──────────────────────────────────────────────────────────

pub enum BrokerStep {
    Token(&'static str),
    Fail(ErrorKind),
    /// Never completes; only cancellation gets the caller out.
    Hang,
}

/// Follows its script, then hands out `tok-N` for the Nth call.
pub struct ScriptedBroker {
    script: Mutex<VecDeque<BrokerStep>>,
    fail_always: Option<ErrorKind>,
    calls: AtomicUsize,
}

impl ScriptedBroker {
    pub fn new(script: Vec<BrokerStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fail_always: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn fresh() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn failing(kind: ErrorKind) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fail_always: Some(kind),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionBroker for ScriptedBroker {
    async fn fetch_fresh(&self) -> Result<CaptchaImage, ErrorKind> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(kind) = self.fail_always {
            return Err(kind);
        }
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(BrokerStep::Token(token)) => {
                Ok(CaptchaImage::new(b"captcha".to_vec(), Session::new(token)))
            }
            Some(BrokerStep::Fail(kind)) => Err(kind),
            Some(BrokerStep::Hang) => std::future::pending().await,
            None => Ok(CaptchaImage::new(
                format!("captcha-{n}").into_bytes(),
                Session::new(format!("tok-{n}")),
            )),
        }
    }
}

pub fn solve_report(guess: Option<&str>) -> SolveReport {
    SolveReport {
        variants: Vec::new(),
        candidates: Vec::new(),
        consensus: match guess {
            Some(text) => ConsensusResult {
                text: Some(text.to_string()),
                support_count: 2,
                basis: ConsensusBasis::Majority,
            },
            None => ConsensusResult::none(),
        },
        elapsed_ms: 1,
    }
}

/// Follows its script, then always guesses `AB12`.
pub struct ScriptedReader {
    guesses: Mutex<VecDeque<Option<&'static str>>>,
    calls: AtomicUsize,
}

impl ScriptedReader {
    pub fn new(guesses: Vec<Option<&'static str>>) -> Arc<Self> {
        Arc::new(Self {
            guesses: Mutex::new(guesses.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn confident() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptchaReader for ScriptedReader {
    async fn read(&self, _image: &[u8]) -> SolveReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let guess = self.guesses.lock().unwrap().pop_front().unwrap_or(Some("AB12"));
        solve_report(guess)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub username: String,
    pub token: String,
    pub code: String,
    pub attempt_number: u32,
}

/// Follows its script, then accepts.
pub struct ScriptedSubmitter {
    replies: Mutex<VecDeque<SubmitReply>>,
    seen: Mutex<Vec<Submitted>>,
}

impl ScriptedSubmitter {
    pub fn new(replies: Vec<SubmitReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn seen(&self) -> Vec<Submitted> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialSubmitter for ScriptedSubmitter {
    async fn submit(&self, attempt: &LoginAttempt<'_>) -> SubmitReply {
        self.seen.lock().unwrap().push(Submitted {
            username: attempt.credentials.username().to_string(),
            token: attempt.session.token().to_string(),
            code: attempt.captcha_text.to_string(),
            attempt_number: attempt.attempt_number,
        });
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SubmitReply::Status("ok".into()))
    }
}

pub fn status(s: &str) -> SubmitReply {
    SubmitReply::Status(s.to_string())
}

pub fn controller(
    broker: Arc<ScriptedBroker>,
    reader: Arc<ScriptedReader>,
    submitter: Arc<ScriptedSubmitter>,
    config: ControllerConfig,
) -> LoginAttemptController {
    LoginAttemptController::new(broker, submitter, reader, config)
}
