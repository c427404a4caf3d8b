//! reqwest-backed implementation of [`BackendApi`].

use crate::api::BackendApi;
use crate::query::messages_query;
use async_trait::async_trait;
use chat_types::{
    BadgeCounts, Conversation, ConversationId, ConversationKind, ConversationSummary, Message,
    MessageCursor, MessageId, NewMessage, NotificationEntry, Participant, SyncError, SyncResult,
    UserId, UserProfile,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

/// Connection settings for the backend REST API.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Project API base URL (e.g. `https://xyz.example.co`).
    pub api_url: String,
    /// Anonymous API key sent as the `apikey` header.
    pub anon_key: String,
    /// Per-user access token sent as the bearer token.
    pub access_token: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            anon_key: String::new(),
            access_token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// HTTP client for the backend's PostgREST-style REST surface.
///
/// Read paths hit tables directly with filter query strings; multi-row
/// writes and aggregate reads go through `/rest/v1/rpc/` functions so the
/// server stays authoritative over derived state.
#[derive(Clone)]
pub struct BackendClient {
    http_client: reqwest::Client,
    config: BackendConfig,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            config,
        }
    }

    /// Replaces the bearer token after a session refresh.
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.config.access_token = token.into();
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.api_url, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.config.api_url, function)
    }

    fn auth_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.access_token),
            )
            .header("Accept", "application/json")
    }

    /// Maps a non-success response into the shared error taxonomy.
    async fn check(&self, response: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response.text().await.unwrap_or_default();
        error!(status = %status, "backend request failed");
        Err(map_status(status.as_u16(), message, retry_after))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> SyncResult<T> {
        debug!(url = %url, "GET");
        let response = self
            .auth_headers(self.http_client.get(url))
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let response = self.check(response).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        function: &str,
        body: &serde_json::Value,
    ) -> SyncResult<T> {
        let url = self.rpc_url(function);
        debug!(function = %function, "RPC");
        let response = self
            .auth_headers(self.http_client.post(&url))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let response = self.check(response).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }

    async fn rpc_no_response(&self, function: &str, body: &serde_json::Value) -> SyncResult<()> {
        let url = self.rpc_url(function);
        debug!(function = %function, "RPC");
        let response = self
            .auth_headers(self.http_client.post(&url))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }
}

/// Status-to-error mapping shared by every endpoint.
fn map_status(status: u16, message: String, retry_after: Option<Duration>) -> SyncError {
    match status {
        401 | 403 => SyncError::PermissionDenied(message),
        429 => SyncError::RateLimited { retry_after },
        _ => SyncError::Api { status, message },
    }
}

#[derive(Debug, Deserialize)]
struct DmLookupRow {
    conversation_id: ConversationId,
}

#[async_trait]
impl BackendApi for BackendClient {
    async fn get_conversations_with_details(
        &self,
        user_id: &UserId,
    ) -> SyncResult<Vec<ConversationSummary>> {
        let body = serde_json::json!({ "p_user_id": user_id });
        let summaries: Vec<ConversationSummary> =
            self.rpc("get_conversations_with_details", &body).await?;
        debug!(count = summaries.len(), "fetched conversation summaries");
        Ok(summaries)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageCursor>,
        limit: u32,
    ) -> SyncResult<Vec<Message>> {
        let url = format!(
            "{}?{}",
            self.rest_url("messages"),
            messages_query(conversation_id, before, limit)
        );
        self.get_json(&url).await
    }

    async fn insert_message(&self, new_message: &NewMessage) -> SyncResult<Message> {
        let url = self.rest_url("messages");
        let response = self
            .auth_headers(self.http_client.post(&url))
            .header("Content-Type", "application/json")
            // Single-object response instead of a one-element array.
            .header("Accept", "application/vnd.pgrst.object+json")
            .header("Prefer", "return=representation")
            .json(new_message)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let response = self.check(response).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }

    async fn mark_messages_read_batch(
        &self,
        conversation_id: &ConversationId,
        through_message_id: &MessageId,
        user_id: &UserId,
    ) -> SyncResult<()> {
        let body = serde_json::json!({
            "p_conversation_id": conversation_id,
            "p_through_message_id": through_message_id,
            "p_user_id": user_id,
        });
        self.rpc_no_response("mark_messages_read_batch", &body).await
    }

    async fn find_dm_conversation(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> SyncResult<Option<ConversationId>> {
        let body = serde_json::json!({ "p_user_a": user_a, "p_user_b": user_b });
        let rows: Vec<DmLookupRow> = self.rpc("find_dm_conversation", &body).await?;
        Ok(rows.into_iter().next().map(|row| row.conversation_id))
    }

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        creator: &UserId,
        members: &[UserId],
    ) -> SyncResult<Conversation> {
        let body = serde_json::json!({
            "p_kind": kind,
            "p_creator": creator,
            "p_members": members,
        });
        self.rpc("create_conversation", &body).await
    }

    async fn add_participants(
        &self,
        conversation_id: &ConversationId,
        user_ids: &[UserId],
        added_by: &UserId,
    ) -> SyncResult<Vec<Participant>> {
        let body = serde_json::json!({
            "p_conversation_id": conversation_id,
            "p_user_ids": user_ids,
            "p_added_by": added_by,
        });
        self.rpc("add_participants", &body).await
    }

    async fn get_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<Participant>> {
        let url = format!(
            "{}?conversation_id=eq.{}",
            self.rest_url("participants"),
            conversation_id
        );
        self.get_json(&url).await
    }

    async fn get_badge_counts(&self, user_id: &UserId) -> SyncResult<BadgeCounts> {
        let body = serde_json::json!({ "p_user_id": user_id });
        self.rpc("get_badge_counts", &body).await
    }

    async fn get_user_profile(&self, user_id: &UserId) -> SyncResult<UserProfile> {
        let url = format!(
            "{}?user_id=eq.{}&limit=1",
            self.rest_url("profiles"),
            user_id
        );
        let profiles: Vec<UserProfile> = self.get_json(&url).await?;
        profiles.into_iter().next().ok_or_else(|| SyncError::Api {
            status: 404,
            message: format!("no profile for user {user_id}"),
        })
    }

    async fn list_notifications(&self, user_id: &UserId) -> SyncResult<Vec<NotificationEntry>> {
        let url = format!(
            "{}?user_id=eq.{}&order=created_at.desc",
            self.rest_url("notifications"),
            user_id
        );
        self.get_json(&url).await
    }

    async fn mark_all_notifications_read(&self, user_id: &UserId) -> SyncResult<()> {
        // RPC rather than a table PATCH so the server stamps read_at.
        let body = serde_json::json!({ "p_user_id": user_id });
        self.rpc_no_response("mark_all_notifications_read", &body)
            .await
    }
}
