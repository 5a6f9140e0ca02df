//! Stub identity/Helix servers and hook recorders for tests.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::hooks::BackendHooks;

/// One canned response, matched by request-line prefix and an optional
/// substring of the full request (headers and body included).
pub struct Route {
    pub prefix: &'static str,
    pub contains: Option<&'static str>,
    pub status: u16,
    pub body: String,
}

impl Route {
    pub fn new(prefix: &'static str, status: u16, body: &str) -> Self {
        Self {
            prefix,
            contains: None,
            status,
            body: body.to_string(),
        }
    }

    pub fn when_contains(mut self, needle: &'static str) -> Self {
        self.contains = Some(needle);
        self
    }

    fn matches(&self, request: &str) -> bool {
        request.starts_with(self.prefix)
            && self.contains.is_none_or(|needle| request.contains(needle))
    }
}

/// A loopback HTTP stub serving routed canned responses until dropped.
pub struct StubServer {
    pub base: String,
    hits: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn spawn(routes: Vec<Route>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits: Arc<Mutex<Vec<String>>> = Arc::default();

        let recorded = Arc::clone(&hits);
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    continue;
                };
                let request = read_request(&mut stream).await;
                recorded.lock().unwrap().push(request.clone());

                let (status, body) = routes
                    .iter()
                    .find(|r| r.matches(&request))
                    .map(|r| (r.status, r.body.clone()))
                    .unwrap_or((404, String::new()));

                let response = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self { base, hits, task }
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    fn identity_json() -> &'static str {
        r#"{"client_id":"the-id","login":"streamer","user_id":"1234","scopes":["user:write:chat"],"expires_in":5000}"#
    }

    /// Identity stub where the whole flow succeeds.
    pub async fn identity_ok() -> Self {
        Self::spawn(vec![
            Route::new("GET /authorize", 200, "<html>consent</html>"),
            Route::new(
                "POST /token",
                200,
                r#"{"access_token":"acc","refresh_token":"ref","expires_in":3600}"#,
            ),
            Route::new("GET /validate", 200, Self::identity_json()),
        ])
        .await
    }

    /// Identity stub that refuses the client id at the consent page.
    pub async fn identity_consent_rejected() -> Self {
        Self::spawn(vec![Route::new("GET /authorize", 400, "invalid client")]).await
    }

    /// Identity stub where the consent page loads but the exchange fails.
    pub async fn identity_exchange_rejected() -> Self {
        Self::spawn(vec![
            Route::new("GET /authorize", 200, "<html>consent</html>"),
            Route::new(
                "POST /token",
                400,
                r#"{"status":400,"message":"Invalid authorization code"}"#,
            ),
            Route::new("GET /validate", 401, r#"{"status":401,"message":"invalid access token"}"#),
        ])
        .await
    }

    /// Identity stub where the stored token is stale but renewal succeeds.
    pub async fn identity_stale_then_renewed() -> Self {
        Self::spawn(vec![
            Route::new("GET /authorize", 200, "<html>consent</html>"),
            Route::new("GET /validate", 200, Self::identity_json())
                .when_contains("OAuth renewed-access"),
            Route::new("GET /validate", 401, r#"{"status":401,"message":"invalid access token"}"#),
            Route::new(
                "POST /token",
                200,
                r#"{"access_token":"renewed-access","refresh_token":"rotated","expires_in":3600}"#,
            ),
        ])
        .await
    }

    /// Identity stub where both the probe and the renewal fail.
    pub async fn identity_all_rejected() -> Self {
        Self::spawn(vec![
            Route::new("GET /authorize", 200, "<html>consent</html>"),
            Route::new("GET /validate", 401, r#"{"status":401,"message":"invalid access token"}"#),
            Route::new(
                "POST /token",
                400,
                r#"{"status":400,"message":"Invalid refresh token"}"#,
            ),
        ])
        .await
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before headers complete");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&raw[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while raw.len() < header_end + content_length {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before body complete");
        raw.extend_from_slice(&buf[..n]);
    }

    String::from_utf8_lossy(&raw).to_string()
}

/// Sends a browser-style redirect request to a bound callback listener.
pub async fn send_redirect(port: u16, target: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nhost: localhost\r\n\r\n", target);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Polls a condition until it holds or a generous deadline passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Hooks that record every callback for assertions.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    auth_results: Mutex<Vec<(bool, String)>>,
    validated: Mutex<Vec<(String, String, String)>>,
}

impl RecordingHooks {
    pub fn auth_results(&self) -> Vec<(bool, String)> {
        self.auth_results.lock().unwrap().clone()
    }

    pub fn validated_credentials(&self) -> Vec<(String, String, String)> {
        self.validated.lock().unwrap().clone()
    }
}

impl BackendHooks for RecordingHooks {
    fn on_auth_result(&self, success: bool, message: &str) {
        self.auth_results
            .lock()
            .unwrap()
            .push((success, message.to_string()));
    }

    fn on_credentials_validated(&self, client_id: &str, client_secret: &str, code: &str) {
        self.validated.lock().unwrap().push((
            client_id.to_string(),
            client_secret.to_string(),
            code.to_string(),
        ));
    }
}
