//! `WebApp` driven by a `Controller` against a local HTTP stub.

use appctl_apps::{RuleGuard, WebApp, WebAppError, WebAppSpec};
use appctl_core::{AppState, Backoff, Controller, ControllerError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const JOB_ID: &str = "42";

/// A request as seen by the stub service.
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    body: String,
    at: Instant,
}

/// Minimal job service: reports `running` for the first `pending_polls`
/// status requests, then `final_status`.
struct StubService {
    base: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl StubService {
    async fn start(pending_polls: usize, final_status: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let status_calls = Arc::new(AtomicUsize::new(0));

        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let log = log.clone();
                let status_calls = status_calls.clone();
                tokio::spawn(async move {
                    handle(stream, log, status_calls, pending_polls, final_status).await;
                });
            }
        });

        Self { base, seen }
    }

    fn spec(&self) -> WebAppSpec {
        WebAppSpec::new(
            format!("{}/jobs", self.base),
            format!("{}/jobs/{{id}}/status", self.base),
            format!("{}/jobs/{{id}}/result", self.base),
        )
        .with_cancel_url(format!("{}/jobs/{{id}}", self.base))
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn routes(&self) -> Vec<String> {
        self.seen()
            .into_iter()
            .map(|s| format!("{} {}", s.method, s.path))
            .collect()
    }
}

async fn handle(
    mut stream: TcpStream,
    log: Arc<Mutex<Vec<Seen>>>,
    status_calls: Arc<AtomicUsize>,
    pending_polls: usize,
    final_status: &str,
) {
    let Ok((method, path, body)) = read_request(&mut stream).await else {
        return;
    };
    log.lock().unwrap().push(Seen {
        method: method.clone(),
        path: path.clone(),
        body,
        at: Instant::now(),
    });

    let status_path = format!("/jobs/{}/status", JOB_ID);
    let result_path = format!("/jobs/{}/result", JOB_ID);
    let job_path = format!("/jobs/{}", JOB_ID);

    let (code, reply) = match (method.as_str(), path.as_str()) {
        ("POST", "/jobs") => ("200 OK", json!({ "id": JOB_ID })),
        ("GET", p) if p == status_path => {
            let calls = status_calls.fetch_add(1, Ordering::SeqCst);
            let status = if calls < pending_polls {
                "running"
            } else {
                final_status
            };
            ("200 OK", json!({ "status": status }))
        }
        ("GET", p) if p == result_path => ("200 OK", json!({ "answer": 7 })),
        ("DELETE", p) if p == job_path => ("200 OK", json!({ "deleted": true })),
        _ => ("404 Not Found", json!({ "error": "unknown route" })),
    };

    let reply = reply.to_string();
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reply.len(),
        reply
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<(String, String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    Ok((method, path, body))
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_submit_poll_and_fetch_result() {
    let service = StubService::start(2, "done").await;
    let app = WebApp::new(service.spec(), json!({ "n": 7 }))
        .with_client(client())
        .with_rules(RuleGuard::new(Duration::from_millis(30)))
        .poll_interval(Backoff::fixed(Duration::from_millis(5)));
    let controller = Controller::new(app);

    controller.start().await.unwrap();
    let output = controller.join(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(output, json!({ "answer": 7 }));
    assert_eq!(controller.get_app_state(), AppState::Joined);

    let status = format!("GET /jobs/{}/status", JOB_ID);
    assert_eq!(
        service.routes(),
        vec![
            "POST /jobs".to_string(),
            status.clone(),
            status.clone(),
            status,
            format!("GET /jobs/{}/result", JOB_ID),
        ]
    );

    let seen = service.seen();
    let submitted: Value = serde_json::from_str(&seen[0].body).unwrap();
    assert_eq!(submitted, json!({ "n": 7 }));

    // Polls every 5 ms, but the guard spaces requests by 30 ms.
    for pair in seen.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(gap >= Duration::from_millis(25), "requests {:?} apart", gap);
    }
}

#[tokio::test]
async fn test_cancel_pending_job_deletes_remotely() {
    let service = StubService::start(usize::MAX, "done").await;
    let app = WebApp::new(service.spec(), json!({}))
        .with_client(client())
        .with_rules(RuleGuard::unrestricted())
        .poll_interval(Backoff::fixed(Duration::from_millis(10)));
    let controller = Controller::new(app);

    controller.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.get_app_state(), AppState::Running);

    controller.cancel().await.unwrap();
    assert_eq!(controller.get_app_state(), AppState::Cancelled);

    let routes = service.routes();
    assert_eq!(routes.first().map(String::as_str), Some("POST /jobs"));
    assert_eq!(routes.last(), Some(&format!("DELETE /jobs/{}", JOB_ID)));
    assert!(!routes.iter().any(|r| r.ends_with("/result")));
}

#[tokio::test]
async fn test_remote_failure_reaches_join_without_cancel() {
    let service = StubService::start(1, "failed").await;
    let app = WebApp::new(service.spec(), json!({}))
        .with_client(client())
        .with_rules(RuleGuard::unrestricted())
        .poll_interval(Backoff::fixed(Duration::from_millis(5)));
    let controller = Controller::new(app);

    controller.start().await.unwrap();
    let err = controller
        .join(Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    match err {
        ControllerError::Evaluation(source) => match source.downcast_ref::<WebAppError>() {
            Some(WebAppError::RemoteFailed { id, status }) => {
                assert_eq!(id, JOB_ID);
                assert_eq!(status, "failed");
            }
            other => panic!("Expected RemoteFailed, got: {:?}", other),
        },
        other => panic!("Expected Evaluation, got: {:?}", other),
    }
    assert_eq!(controller.get_app_state(), AppState::Failed);

    // A job the service already settled is not cancelled remotely.
    let routes = service.routes();
    assert!(!routes.iter().any(|r| r.starts_with("DELETE")), "{:?}", routes);
    assert!(!routes.iter().any(|r| r.ends_with("/result")));
}
