//! WebSocket client plumbing for the alert channel
//!
//! The channel drives an [`AlertSocket`] obtained from an [`AlertConnector`].
//! [`TungsteniteConnector`] is the production implementation.

use super::ChannelError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::debug;
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// A received frame, reduced to what the channel cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    /// Server closed the connection, with its close code if any
    Close(Option<u16>),
    /// Raw frames and anything else
    Other,
}

impl From<Message> for AlertFrame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => AlertFrame::Text(text.to_string()),
            Message::Binary(data) => AlertFrame::Binary(data.to_vec()),
            Message::Ping(_) => AlertFrame::Ping,
            Message::Pong(_) => AlertFrame::Pong,
            Message::Close(frame) => AlertFrame::Close(frame.map(|f| u16::from(f.code))),
            Message::Frame(_) => AlertFrame::Other,
        }
    }
}

/// Read half of an alert socket
#[async_trait]
pub trait AlertStream: Send {
    /// Next frame; `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<AlertFrame, ChannelError>>;
}

/// Write half of an alert socket
#[async_trait]
pub trait AlertSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;
    async fn ping(&mut self) -> Result<(), ChannelError>;
    /// Close with the going-away code
    async fn close_going_away(&mut self) -> Result<(), ChannelError>;
}

/// An open socket split into halves
pub struct AlertSocket {
    pub sink: Box<dyn AlertSink>,
    pub stream: Box<dyn AlertStream>,
}

/// Opens alert sockets
#[async_trait]
pub trait AlertConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<AlertSocket, ChannelError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl AlertConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<AlertSocket, ChannelError> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        debug!("WebSocket handshake completed for {} ({})", url, response.status());

        let (write, read) = ws_stream.split();
        Ok(AlertSocket {
            sink: Box::new(TungsteniteSink(write)),
            stream: Box::new(TungsteniteStream(read)),
        })
    }
}

struct TungsteniteSink(SplitSink<WsStream, Message>);

#[async_trait]
impl AlertSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), ChannelError> {
        self.0
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn close_going_away(&mut self) -> Result<(), ChannelError> {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: Cow::Borrowed(""),
        };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        self.0.close().await.map_err(|e| ChannelError::Send(e.to_string()))
    }
}

struct TungsteniteStream(SplitStream<WsStream>);

#[async_trait]
impl AlertStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<Result<AlertFrame, ChannelError>> {
        self.0.next().await.map(|message| {
            message
                .map(AlertFrame::from)
                .map_err(|e| ChannelError::Receive(e.to_string()))
        })
    }
}
