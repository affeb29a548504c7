use crate::error::AppError;
use crate::pulse::session::{FeedConnector, FeedLink};
use crate::pulse::simulator::TokenSource;
use crate::pulse::types::{parse_feed_payload, FeedEvent, TokenPayload};
use async_trait::async_trait;
use futures_util::future;
use futures_util::StreamExt;
use reqwest::Client;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

const MAX_MESSAGE_SIZE: usize = 16 << 20;
const MAX_FRAME_SIZE: usize = 4 << 20;

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

/// Maps one websocket read to a feed item. Control frames yield nothing; a
/// close frame or read error ends the link.
pub fn decode_frame(frame: Result<Message, WsError>) -> Option<Result<FeedEvent, AppError>> {
    match frame {
        Ok(Message::Text(text)) => {
            let mut owned_payload = text.into_bytes();
            Some(parse_feed_payload(owned_payload.as_mut_slice()))
        }
        Ok(Message::Binary(mut binary_payload)) => {
            Some(parse_feed_payload(binary_payload.as_mut_slice()))
        }
        Ok(Message::Close(frame)) => {
            let reason = frame
                .map(|close| close.reason.to_string())
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| "no reason given".to_string());
            Some(Err(AppError::Transport(format!(
                "feed closed by server: {reason}"
            ))))
        }
        Ok(_) => None,
        Err(error) => Some(Err(error.into())),
    }
}

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self) -> Result<FeedLink, AppError> {
        info!(url = %self.url, "opening feed websocket");
        let (stream, response) =
            connect_async_with_config(self.url.as_str(), Some(ws_config()), true).await?;
        debug!(status = %response.status(), "feed websocket handshake complete");
        let link: FeedLink = stream
            .filter_map(|frame| future::ready(decode_frame(frame)))
            .boxed();
        Ok(link)
    }
}

/// Loads the initial token set from a JSON array endpoint.
pub struct HttpTokenSource {
    client: Client,
    url: String,
}

impl HttpTokenSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch_tokens(&self) -> Result<Vec<TokenPayload>, AppError> {
        let response = self
            .client
            .get(self.url.as_str())
            .send()
            .await?
            .error_for_status()?;
        let payload = response.json::<Vec<TokenPayload>>().await?;
        debug!(count = payload.len(), "fetched token snapshot");
        Ok(payload)
    }
}
