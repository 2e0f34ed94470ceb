//! Tunnel engine
//!
//! Bridges one accepted client connection to the gateway over a WebSocket
//! session. The wire contract with the gateway:
//!
//! ```text
//! → TEXT   "CONNECT:<target>|<first_frame>"
//! ← TEXT   "CONNECTED" | "ERROR:<reason>"
//! ⇄ BINARY payload
//! ⇄ TEXT   "CLOSE"          (orderly teardown)
//! → PING   every 10 s       (empty payload)
//! ```
//!
//! Every outbound frame funnels through a single writer task fed by a
//! bounded channel, so pings, the control message, and payload stay totally
//! ordered even though they originate from different tasks. The first copy
//! direction to finish ends the session.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::common::{LogHandle, Stream};
use crate::error::{Error, Result};
use crate::protocol::{Handshake, ProxyMode};
use crate::session::WsDialer;

const COPY_BUFFER_SIZE: usize = 32 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const PEEK_TIMEOUT: Duration = Duration::from_millis(100);
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const DIAL_RETRIES: u32 = 2;
const OUTBOUND_QUEUE: usize = 32;

const CONNECTED_TOKEN: &str = "CONNECTED";
const CLOSE_TOKEN: &str = "CLOSE";
const ERROR_PREFIX: &str = "ERROR:";

/// Open a gateway session for the finished inbound handshake and pump bytes
/// until either side is done.
pub async fn run(
    dialer: &WsDialer,
    log: &LogHandle,
    client_addr: &str,
    handshake: Handshake,
) -> Result<()> {
    let Handshake {
        mode,
        target,
        first_frame,
        mut stream,
    } = handshake;

    let ws = match dialer.dial(DIAL_RETRIES).await {
        Ok(ws) => ws,
        Err(e) => {
            mode.write_failure(&mut stream).await;
            return Err(e);
        }
    };

    bridge(ws, mode, target, first_frame, stream, log, client_addr).await
}

async fn bridge<S>(
    ws: WebSocketStream<S>,
    mode: ProxyMode,
    target: String,
    mut first_frame: Vec<u8>,
    mut stream: Stream,
    log: &LogHandle,
    client_addr: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut ws_reader) = ws.split();

    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(sink, rx));
    let keepalive = tokio::spawn(keepalive_loop(tx.clone()));

    // SOCKS5 carries no parsed request body; whatever the client has already
    // sent (e.g. a TLS ClientHello) rides along in the CONNECT message so the
    // gateway can start its outbound connect without another round trip.
    if first_frame.is_empty() && mode == ProxyMode::Socks5 {
        first_frame = peek_first_frame(&mut stream).await;
    }

    let connect = format!(
        "CONNECT:{}|{}",
        target,
        String::from_utf8_lossy(&first_frame)
    );
    if tx.send(Message::Text(connect)).await.is_err() {
        keepalive.abort();
        mode.write_failure(&mut stream).await;
        return Err(Error::Dial("gateway write channel closed".into()));
    }

    let established = match ws_reader.next().await {
        Some(Ok(Message::Text(text))) => {
            if text == CONNECTED_TOKEN {
                Ok(())
            } else if text.starts_with(ERROR_PREFIX) {
                Err(Error::Protocol(format!("gateway refused connect: {}", text)))
            } else {
                Err(Error::Protocol(format!(
                    "unexpected gateway response: {}",
                    text
                )))
            }
        }
        Some(Ok(_)) => Err(Error::Protocol(
            "non-text gateway response to connect".into(),
        )),
        Some(Err(e)) => Err(Error::Dial(format!("gateway read failed: {}", e))),
        None => Err(Error::Dial("gateway closed before accepting".into())),
    };

    if let Err(e) = established {
        keepalive.abort();
        mode.write_failure(&mut stream).await;
        return Err(e);
    }

    if let Err(e) = mode.write_success(&mut stream).await {
        keepalive.abort();
        return Err(e);
    }
    log.info(&format!("connected: {} -> {}", client_addr, target));

    let (client_reader, client_writer) = tokio::io::split(stream);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

    let c2g = tokio::spawn(client_to_gateway(
        client_reader,
        tx.clone(),
        done_tx.clone(),
    ));
    let g2c = tokio::spawn(gateway_to_client(ws_reader, client_writer, done_tx));

    let _ = done_rx.recv().await;

    keepalive.abort();
    c2g.abort();
    g2c.abort();
    drop(tx);
    let _ = tokio::time::timeout(CLOSE_GRACE, writer).await;

    log.info(&format!("disconnected: {} -> {}", client_addr, target));
    Ok(())
}

/// Sole owner of the WebSocket sink; closes it once every sender is gone.
async fn write_loop<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, mut rx: mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn keepalive_loop(tx: mpsc::Sender<Message>) {
    let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        if tx.send(Message::Ping(Vec::new())).await.is_err() {
            return;
        }
    }
}

/// Opportunistic grab of pre-buffered client bytes. Empty on timeout; the
/// tunnel works either way.
async fn peek_first_frame(stream: &mut Stream) -> Vec<u8> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    match tokio::time::timeout(PEEK_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            buf
        }
        _ => Vec::new(),
    }
}

async fn client_to_gateway(
    mut reader: ReadHalf<Stream>,
    tx: mpsc::Sender<Message>,
    done: mpsc::Sender<()>,
) {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(Message::Text(CLOSE_TOKEN.to_string())).await;
                break;
            }
            Ok(n) => {
                if tx.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = done.send(()).await;
}

async fn gateway_to_client<S>(
    mut ws_reader: SplitStream<WebSocketStream<S>>,
    mut writer: WriteHalf<Stream>,
    done: mpsc::Sender<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws_reader.next().await {
        let payload = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => {
                if text == CLOSE_TOKEN {
                    break;
                }
                // Unsolicited text is forwarded as payload.
                text.into_bytes()
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(frame)) => {
                debug!("gateway sent close frame: {:?}", frame);
                break;
            }
            Ok(Message::Frame(_)) => break,
            Err(e) => {
                debug!("gateway read error: {}", e);
                break;
            }
        };

        if writer.write_all(&payload).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = done.send(()).await;
}
