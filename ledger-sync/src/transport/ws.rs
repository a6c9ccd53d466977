//! WebSocket connector.
//!
//! Each connection spawns a writer task (outbound channel → socket) and a
//! reader task (socket → inbound channel). Text and UTF-8 binary frames are
//! forwarded; control frames are left to tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{Connection, Connector, TransportError, CHANNEL_CAPACITY};

#[derive(Debug, Clone)]
pub struct WsConnector {
    capacity: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl WsConnector {
    /// Connector with `capacity` buffered frames per direction (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<String>(self.capacity);

        // Writer: runs until the session drops its sender, then closes.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        let peer = url.to_owned();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => {
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                log::debug!("Dropping non-UTF-8 binary frame from {peer}");
                                continue;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("Socket error on {peer}: {e}");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("ws://127.0.0.1:{port}/orders/all");
        let err = WsConnector::default().connect(&url).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { url: u, .. } if u == url));
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(WsConnector::new(0).capacity, 1);
    }
}
