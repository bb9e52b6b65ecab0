//! Allocation exec over Nomad's WebSocket endpoint.
//!
//! Nomad frames every message as JSON. Byte payloads are base64 encoded.
//!
//! Client → server:
//! - `{"stdin":{"data":"..."}}`, `{"stdin":{"close":true}}`
//! - `{"tty_size":{"height":H,"width":W}}`
//! - `{}` as a heartbeat
//!
//! Server → client:
//! - `{"stdout":{"data":"..."}}`, `{"stderr":{"data":"..."}}`
//! - `{"exited":true,"result":{"exit_code":N}}`

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

use super::ExecIo;
use nomad_common::terminal::TerminalSize;
use nomad_core::error::{Result, WorkspaceError};
use nomad_core::CancellationToken;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const STDIN_CHUNK: usize = 16 * 1024;

pub(crate) struct ExecTarget {
    pub url: Url,
    pub token: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StreamFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub close: bool,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct InputFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<StreamFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tty_size: Option<TtySize>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub(crate) struct TtySize {
    pub height: u16,
    pub width: u16,
}

impl InputFrame {
    pub fn stdin_data(bytes: &[u8]) -> Self {
        Self {
            stdin: Some(StreamFrame {
                data: Some(BASE64.encode(bytes)),
                close: false,
            }),
            tty_size: None,
        }
    }

    pub fn stdin_close() -> Self {
        Self {
            stdin: Some(StreamFrame {
                data: None,
                close: true,
            }),
            tty_size: None,
        }
    }

    pub fn resize(size: TerminalSize) -> Self {
        Self {
            stdin: None,
            tty_size: Some(TtySize {
                height: size.height,
                width: size.width,
            }),
        }
    }

    pub fn heartbeat() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OutputFrame {
    #[serde(default)]
    pub stdout: Option<StreamFrame>,
    #[serde(default)]
    pub stderr: Option<StreamFrame>,
    #[serde(default)]
    pub exited: bool,
    #[serde(default)]
    pub result: Option<ExitResult>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ExitResult {
    #[serde(default)]
    pub exit_code: i32,
}

fn decode(frame: &StreamFrame) -> Result<Vec<u8>> {
    match &frame.data {
        Some(data) => BASE64
            .decode(data)
            .map_err(|e| WorkspaceError::RemoteExec(format!("malformed output frame: {}", e))),
        None => Ok(Vec::new()),
    }
}

async fn write_all(out: &mut (dyn AsyncWrite + Send + Unpin), bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    out.write_all(bytes).await?;
    out.flush().await?;
    Ok(())
}

async fn send_frame<S>(sink: &mut S, frame: &InputFrame) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::text(text))
        .await
        .map_err(|e| WorkspaceError::RemoteExec(format!("failed to send exec frame: {}", e)))
}

async fn pump_stdin(mut stdin: Box<dyn AsyncRead + Send + Unpin>, tx: mpsc::Sender<InputFrame>) {
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(InputFrame::stdin_data(&buf[..n])).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "stdin read failed, closing remote stdin");
                break;
            }
        }
    }
    let _ = tx.send(InputFrame::stdin_close()).await;
}

/// Receive from an optional channel; a missing or closed channel never yields.
async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> T {
    if let Some(inner) = rx.as_mut() {
        if let Some(value) = inner.recv().await {
            return value;
        }
        *rx = None;
    }
    std::future::pending().await
}

/// Attach to the exec endpoint and drive the session until the remote
/// command exits, the stream fails, or `cancel` fires.
pub(crate) async fn run_session(
    target: ExecTarget,
    io: ExecIo,
    cancel: &CancellationToken,
) -> Result<i32> {
    let mut request = target
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| WorkspaceError::RemoteExec(format!("invalid exec request: {}", e)))?;
    if let Some(token) = &target.token {
        let value = HeaderValue::from_str(token)
            .map_err(|_| WorkspaceError::Config("NOMAD_TOKEN is not a valid header value".into()))?;
        request.headers_mut().insert("X-Nomad-Token", value);
    }

    let (socket, _) = tokio::select! {
        _ = cancel.cancelled() => return Err(WorkspaceError::Cancelled),
        connected = tokio_tungstenite::connect_async(request) => connected
            .map_err(|e| WorkspaceError::RemoteExec(format!("failed to attach: {}", e)))?,
    };
    let (mut sink, mut stream) = socket.split();

    let ExecIo {
        stdin,
        mut stdout,
        mut stderr,
        resize,
    } = io;
    let mut resize = resize;

    let (input_tx, input_rx) = mpsc::channel::<InputFrame>(16);
    let mut input_rx = Some(input_rx);
    let stdin_task = match stdin {
        Some(stdin) => Some(tokio::spawn(pump_stdin(stdin, input_tx))),
        None => {
            drop(input_tx);
            send_frame(&mut sink, &InputFrame::stdin_close()).await?;
            None
        }
    };

    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Err(WorkspaceError::Cancelled);
            }
            frame = recv_or_pending(&mut input_rx) => {
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    break Err(e);
                }
            }
            size = recv_or_pending(&mut resize) => {
                if let Err(e) = send_frame(&mut sink, &InputFrame::resize(size)).await {
                    break Err(e);
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = send_frame(&mut sink, &InputFrame::heartbeat()).await {
                    break Err(e);
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let frame: OutputFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => break Err(WorkspaceError::RemoteExec(format!("malformed exec frame: {}", e))),
                    };
                    if let Some(out) = &frame.stdout {
                        if let Err(e) = write_frame(stdout.as_mut(), out).await {
                            break Err(e);
                        }
                    }
                    if let Some(err) = &frame.stderr {
                        if let Err(e) = write_frame(stderr.as_mut(), err).await {
                            break Err(e);
                        }
                    }
                    if frame.exited {
                        let code = frame.result.map(|r| r.exit_code).unwrap_or(0);
                        trace!(exit_code = code, "remote command exited");
                        break Ok(code);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break Err(WorkspaceError::RemoteExec(format!(
                        "exec stream closed before the command exited ({:?})",
                        frame
                    )));
                }
                Some(Err(e)) => {
                    break Err(WorkspaceError::RemoteExec(format!("exec stream error: {}", e)));
                }
                None => {
                    break Err(WorkspaceError::RemoteExec(
                        "exec stream ended before the command exited".to_string(),
                    ));
                }
                _ => {}
            }
        }
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    outcome
}

async fn write_frame(out: &mut (dyn AsyncWrite + Send + Unpin), frame: &StreamFrame) -> Result<()> {
    write_all(out, &decode(frame)?).await
}
