//! Loopback listener for the authorization redirect.
//!
//! A transient local HTTP endpoint that exists for exactly one authorization
//! attempt: it waits for the identity provider to redirect the user's
//! browser back, extracts the authorization code (or the error the provider
//! attached), reports it through a one-shot sink, and goes away.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What the redirect carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    /// The authorization code to exchange.
    Code(String),
    /// The provider reported an error; displayable message.
    Denied(String),
}

/// A bound redirect listener serving on a background task.
///
/// At most one instance should be live at a time; the fixed local port is
/// part of the registered redirect URI and is reused for every attempt.
/// The serving task ends after delivering one result; [`stop`](Self::stop)
/// tears it down early and waits until the port is released.
#[derive(Debug)]
pub struct AuthCallbackListener {
    port: u16,
    task: Option<JoinHandle<()>>,
}

impl AuthCallbackListener {
    /// Binds the listener and starts serving.
    ///
    /// Exactly one result is pushed into `sink`: the first matching redirect
    /// request decides it. Port 0 binds an ephemeral port; the actual port
    /// is available via [`port`](Self::port).
    pub async fn bind(
        port: u16,
        callback_path: &str,
        sink: oneshot::Sender<CallbackResult>,
    ) -> io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        // The port is rebound on every attempt; without reuse the previous
        // attempt's TIME_WAIT connections would block it.
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([127, 0, 0, 1], port)))?;
        let listener = socket.listen(16)?;
        let port = listener.local_addr()?.port();

        info!("auth callback listener bound on port {}", port);
        let path = callback_path.to_string();
        let task = tokio::spawn(serve(listener, path, sink));

        Ok(Self {
            port,
            task: Some(task),
        })
    }

    /// The actually bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops the listener and waits for the port to be released.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            debug!("auth callback listener on port {} stopped", self.port);
        }
    }
}

impl Drop for AuthCallbackListener {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Accept loop: answers incidental requests, exits after one result.
async fn serve(listener: TcpListener, callback_path: String, sink: oneshot::Sender<CallbackResult>) {
    let mut sink = Some(sink);
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("failed to accept callback connection: {}", e);
                continue;
            }
        };

        match handle_request(stream, &callback_path).await {
            Ok(Some(result)) => {
                if let Some(sink) = sink.take() {
                    let _ = sink.send(result);
                }
                // One result delivered; ending the task releases the port.
                return;
            }
            // Not the redirect (favicon and friends); keep listening.
            Ok(None) => continue,
            Err(e) => {
                debug!("callback connection error: {}", e);
                continue;
            }
        }
    }
}

/// Handles one connection; Some(result) only for a matching redirect.
///
/// The response is fully written and flushed before this returns, so the
/// browser always sees its page even though the listener shuts down right
/// after.
async fn handle_request(
    mut stream: TcpStream,
    callback_path: &str,
) -> io::Result<Option<CallbackResult>> {
    let mut reader = BufReader::new(&mut stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let target = match request_line.split_whitespace().nth(1) {
        Some(target) => target.to_string(),
        None => return Ok(None),
    };

    // Drain the headers so the peer is not mid-write when we respond.
    let mut header = String::new();
    loop {
        header.clear();
        let n = reader.read_line(&mut header).await?;
        if n == 0 || header == "\r\n" || header == "\n" {
            break;
        }
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target.as_str(), ""),
    };

    if !path.starts_with(callback_path) {
        // Browsers fetch favicons and the like; stay alive for the redirect.
        write_response(&mut stream, 201, "Created", "").await?;
        return Ok(None);
    }

    let mut code = None;
    let mut error = None;
    let mut error_description = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => error_description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        let message = error_description.unwrap_or(error);
        write_response(&mut stream, 500, "Internal Server Error", &message).await?;
        return Ok(Some(CallbackResult::Denied(message)));
    }

    match code {
        Some(code) => {
            write_response(
                &mut stream,
                200,
                "OK",
                "Success! You can close this browser window.",
            )
            .await?;
            Ok(Some(CallbackResult::Code(code)))
        }
        None => {
            let message = "authorization redirect carried no code".to_string();
            write_response(&mut stream, 500, "Internal Server Error", &message).await?;
            Ok(Some(CallbackResult::Denied(message)))
        }
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
