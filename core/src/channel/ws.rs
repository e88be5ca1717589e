/// WebSocket transport speaking STOMP
use super::stomp::{Command, StompFrame, ACCEPT_VERSION};
use super::{ClientFrame, Link, ServerFrame, Transport};
use crate::error::{Result, SyncError};
use crate::session::Credentials;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn connection_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Io(e) => SyncError::Io(e),
        other => SyncError::Connection(other.to_string()),
    }
}

/// `host[:port]` part of a ws:// or wss:// URL
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, credentials: &Credentials) -> Result<Link> {
        let bearer = format!("Bearer {}", credentials.token);
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(connection_error)?;
        let value = HeaderValue::from_str(&bearer)
            .map_err(|_| SyncError::Config("Session token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(connection_error)?;
        let (mut sink, mut stream) = ws.split();

        let connect = StompFrame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host_of(&self.url))
            .header("heart-beat", "0,0")
            .header("Authorization", bearer);
        sink.send(WsMessage::Text(connect.encode().into()))
            .await
            .map_err(connection_error)?;

        // The caller bounds this wait with its connect timeout.
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match StompFrame::decode(&text)? {
                    Some(frame) if frame.command == Command::Connected => {
                        debug!("STOMP session established (version {:?})", frame.get("version"));
                        break;
                    }
                    Some(frame) if frame.command == Command::Error => {
                        let reason = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
                        return Err(SyncError::Connection(format!("Handshake rejected: {}", reason)));
                    }
                    _ => continue,
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(SyncError::Connection("Closed during handshake".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(connection_error(e)),
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(sink, stream, out_rx, in_tx));
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn to_stomp(frame: ClientFrame, subscriptions: &mut HashMap<String, String>) -> StompFrame {
    match frame {
        ClientFrame::Subscribe { id, topic } => {
            subscriptions.insert(id.clone(), topic.clone());
            StompFrame::new(Command::Subscribe)
                .header("id", id)
                .header("destination", topic)
        }
        ClientFrame::Unsubscribe { id } => {
            subscriptions.remove(&id);
            StompFrame::new(Command::Unsubscribe).header("id", id)
        }
        ClientFrame::Send { destination, body } => StompFrame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body),
        ClientFrame::Disconnect => StompFrame::new(Command::Disconnect),
    }
}

/// Shuttle frames between the engine and the socket until either side goes away
async fn pump<S, R>(
    mut sink: S,
    mut stream: R,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    inbound: mpsc::UnboundedSender<ServerFrame>,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let mut subscriptions: HashMap<String, String> = HashMap::new();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.close().await;
                    return;
                };
                let closing = frame == ClientFrame::Disconnect;
                let wire = to_stomp(frame, &mut subscriptions).encode();
                if let Err(e) = sink.send(WsMessage::Text(wire.into())).await {
                    warn!("WebSocket write failed: {}", e);
                    return;
                }
                if closing {
                    let _ = sink.close().await;
                    return;
                }
            }
            message = stream.next() => {
                let text = match message {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket read failed: {}", e);
                        return;
                    }
                };
                let frame = match StompFrame::decode(&text) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Ignoring undecodable frame: {}", e);
                        continue;
                    }
                };
                let forwarded = match frame.command {
                    Command::Message => {
                        let topic = frame
                            .get("subscription")
                            .and_then(|id| subscriptions.get(id).cloned())
                            .or_else(|| frame.get("destination").map(String::from))
                            .unwrap_or_default();
                        inbound.send(ServerFrame::Event { topic, body: frame.body })
                    }
                    Command::Error => {
                        let message = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
                        let _ = inbound.send(ServerFrame::Error { message });
                        return;
                    }
                    _ => continue,
                };
                if forwarded.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_errors_keep_their_io_kind() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        match connection_error(tungstenite::Error::Io(refused)) {
            SyncError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(
            connection_error(tungstenite::Error::ConnectionClosed),
            SyncError::Connection(_)
        ));
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("ws://localhost:8080/ws/websocket"), "localhost:8080");
        assert_eq!(host_of("wss://market.example?x=1"), "market.example");
    }

    #[test]
    fn test_subscription_ids_map_back_to_topics() {
        let mut subs = HashMap::new();
        let frame = to_stomp(
            ClientFrame::Subscribe {
                id: "sub-3".to_string(),
                topic: "/user/queue/messages".to_string(),
            },
            &mut subs,
        );
        assert_eq!(frame.get("destination"), Some("/user/queue/messages"));
        assert_eq!(subs.get("sub-3").map(String::as_str), Some("/user/queue/messages"));

        let frame = to_stomp(ClientFrame::Unsubscribe { id: "sub-3".to_string() }, &mut subs);
        assert_eq!(frame.command, Command::Unsubscribe);
        assert!(subs.is_empty());
    }
}
