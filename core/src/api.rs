/// REST client for the chat backend
///
/// Endpoints (all carry `Authorization: Bearer <token>`):
///   GET  /user/me                       current user
///   GET  /messages/inbox                conversation list, newest first
///   GET  /messages/conversation/{id}    full history with one peer
///   GET  /messages/unread-count         global unread count
///   POST /messages/send                 fallback send, returns the stored message
///   POST /messages/mark-read/{id}       clear unread for one peer
use crate::error::{Result, SyncError};
use crate::session::SessionContext;
use crate::types::{ConversationSummary, InboundMessage, InboxEntry, OutboundFrame, UserId, UserRef};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Backend operations the engine needs besides the push channel
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_me(&self) -> Result<UserRef>;

    async fn fetch_inbox(&self) -> Result<Vec<ConversationSummary>>;

    async fn fetch_history(&self, peer: UserId) -> Result<Vec<InboundMessage>>;

    async fn fetch_unread_count(&self) -> Result<u64>;

    async fn send_message(&self, frame: &OutboundFrame) -> Result<InboundMessage>;

    async fn mark_read(&self, peer: UserId) -> Result<()>;
}

/// The unread endpoint answers either a bare number or `{"count": n}`
#[derive(Deserialize)]
#[serde(untagged)]
enum UnreadCount {
    Bare(u64),
    Wrapped { count: u64 },
}

impl From<UnreadCount> for u64 {
    fn from(value: UnreadCount) -> Self {
        match value {
            UnreadCount::Bare(n) | UnreadCount::Wrapped { count: n } => n,
        }
    }
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    context: SessionContext,
}

impl HttpChatApi {
    pub fn new(base_url: &str, context: SessionContext) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            context,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn token(&self) -> Result<String> {
        self.context.token().ok_or(SyncError::NotAuthenticated)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.token()?)
            .send()
            .await?;
        Ok(check(response).await?.json::<T>().await?)
    }
}

/// Turn non-2xx answers into `SyncError::Api`
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(SyncError::NotAuthenticated);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Api(format!("{} {}", status, body.trim())))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_me(&self) -> Result<UserRef> {
        self.get_json("/user/me").await
    }

    async fn fetch_inbox(&self) -> Result<Vec<ConversationSummary>> {
        let entries: Vec<InboxEntry> = self.get_json("/messages/inbox").await?;
        Ok(entries.into_iter().map(Into::into).collect())
    }

    async fn fetch_history(&self, peer: UserId) -> Result<Vec<InboundMessage>> {
        self.get_json(&format!("/messages/conversation/{}", peer)).await
    }

    async fn fetch_unread_count(&self) -> Result<u64> {
        let count: UnreadCount = self.get_json("/messages/unread-count").await?;
        Ok(count.into())
    }

    async fn send_message(&self, frame: &OutboundFrame) -> Result<InboundMessage> {
        debug!("POST /messages/send to {}", frame.receiver_id);
        let response = self
            .client
            .post(self.url("/messages/send"))
            .bearer_auth(self.token()?)
            .json(frame)
            .send()
            .await?;
        Ok(check(response).await?.json::<InboundMessage>().await?)
    }

    async fn mark_read(&self, peer: UserId) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/messages/mark-read/{}", peer)))
            .bearer_auth(self.token()?)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
