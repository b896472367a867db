//! Wire client for the hosted backend: sign-in and appends over HTTP, the
//! live subscription over a WebSocket listen stream.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{DocumentId, UserId, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{ListenEvent, MessageRecord, MESSAGES_COLLECTION},
};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{IdentityProvider, MessageBackend, SignInOutcome};

const CHANGE_STREAM_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProviderKind {
    Google,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignInRequest {
    provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SignInResponse {
    Completed {
        user_id: UserId,
        #[serde(default)]
        display_name: Option<String>,
    },
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppendDocumentRequest {
    document_id: DocumentId,
    record: MessageRecord,
}

struct RemoteState {
    profile: Option<UserProfile>,
}

pub struct RemoteBackendClient {
    http: Client,
    server_url: String,
    display_name_hint: Option<String>,
    inner: Mutex<RemoteState>,
}

impl RemoteBackendClient {
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        Self::with_display_name_hint(server_url, None)
    }

    /// The hint is forwarded with the sign-in request; the provider may
    /// override it.
    pub fn with_display_name_hint(
        server_url: impl Into<String>,
        display_name_hint: Option<String>,
    ) -> Result<Self> {
        let server_url = server_url.into();
        let parsed = Url::parse(&server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "server url must use http or https, got {}",
                parsed.scheme()
            ));
        }
        Ok(Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            display_name_hint,
            inner: Mutex::new(RemoteState { profile: None }),
        })
    }
}

#[async_trait]
impl IdentityProvider for RemoteBackendClient {
    async fn current_user(&self) -> Result<Option<UserProfile>> {
        Ok(self.inner.lock().await.profile.clone())
    }

    async fn begin_sign_in(&self) -> Result<SignInOutcome> {
        let response = self
            .http
            .post(format!("{}/session/sign_in", self.server_url))
            .json(&SignInRequest {
                provider: ProviderKind::Google,
                display_name: self.display_name_hint.clone(),
            })
            .send()
            .await
            .context("failed to reach the identity provider")?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Ok(SignInOutcome::Failed(ApiError::new(
                error_code_for_status(status),
                message,
            )));
        }

        match response.json::<SignInResponse>().await? {
            SignInResponse::Completed {
                user_id,
                display_name,
            } => {
                let profile = UserProfile {
                    user_id,
                    display_name,
                };
                self.inner.lock().await.profile = Some(profile.clone());
                Ok(SignInOutcome::Completed(profile))
            }
            SignInResponse::Cancelled => Ok(SignInOutcome::Cancelled),
        }
    }
}

#[async_trait]
impl MessageBackend for RemoteBackendClient {
    async fn append(&self, document_id: DocumentId, record: MessageRecord) -> Result<()> {
        self.http
            .post(format!(
                "{}/collections/{MESSAGES_COLLECTION}/documents",
                self.server_url
            ))
            .json(&AppendDocumentRequest {
                document_id,
                record,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn subscribe_changes(&self) -> Result<broadcast::Receiver<ListenEvent>> {
        let ws_url = listen_url(&self.server_url)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect change listener: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();
        info!(url = %ws_url, "listen: change stream connected");

        let (events, receiver) = broadcast::channel(CHANGE_STREAM_BUFFER);
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ListenEvent>(&text) {
                        Ok(event) => {
                            if events.send(event).is_err() {
                                debug!("listen: all change receivers dropped; closing reader");
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = events.send(ListenEvent::Error(ApiError::new(
                                ErrorCode::Internal,
                                format!("invalid listen frame: {err}"),
                            )));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("listen: websocket receive failed: {err}");
                        let _ = events.send(ListenEvent::Error(ApiError::new(
                            ErrorCode::Unavailable,
                            format!("change listener dropped: {err}"),
                        )));
                        break;
                    }
                }
            }
            debug!("listen: change stream reader finished");
        });

        Ok(receiver)
    }
}

fn listen_url(server_url: &str) -> Result<String> {
    let ws_base = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server url must start with http:// or https://"));
    };
    Ok(format!("{ws_base}/collections/{MESSAGES_COLLECTION}/listen"))
}

fn error_code_for_status(status: StatusCode) -> ErrorCode {
    match status.as_u16() {
        401 => ErrorCode::Unauthorized,
        403 => ErrorCode::PermissionDenied,
        404 => ErrorCode::NotFound,
        400 | 422 => ErrorCode::Validation,
        503 => ErrorCode::Unavailable,
        _ => ErrorCode::Internal,
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
