use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{DocumentId, UserProfile},
    error::ApiError,
    protocol::{ChangeBatch, ChangeKind, DocumentChange, ListenEvent, MessageRecord},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod composer;
pub mod remote;

pub use composer::Composer;
pub use remote::RemoteBackendClient;

/// Display name used when the identity provider has nothing richer.
pub const ANONYMOUS: &str = "anonymous";
/// Maximum accepted message length, in characters.
pub const MESSAGE_LENGTH_LIMIT: usize = 1000;

const FEED_UPDATE_BUFFER: usize = 1024;

/// Single-shot result of the delegated sign-in flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    Completed(UserProfile),
    Cancelled,
    Failed(ApiError),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Currently authenticated profile, if any.
    async fn current_user(&self) -> Result<Option<UserProfile>>;
    /// Run the delegated sign-in flow once and wait for its outcome.
    async fn begin_sign_in(&self) -> Result<SignInOutcome>;
}

pub struct MissingIdentityProvider;

#[async_trait]
impl IdentityProvider for MissingIdentityProvider {
    async fn current_user(&self) -> Result<Option<UserProfile>> {
        Err(anyhow!("identity provider is unavailable"))
    }

    async fn begin_sign_in(&self) -> Result<SignInOutcome> {
        Err(anyhow!("identity provider is unavailable"))
    }
}

#[async_trait]
pub trait MessageBackend: Send + Sync {
    /// Append one record to the remote message collection.
    async fn append(&self, document_id: DocumentId, record: MessageRecord) -> Result<()>;
    /// Open the live subscription and return its change stream.
    async fn subscribe_changes(&self) -> Result<broadcast::Receiver<ListenEvent>>;
}

pub struct MissingBackend;

#[async_trait]
impl MessageBackend for MissingBackend {
    async fn append(&self, document_id: DocumentId, _record: MessageRecord) -> Result<()> {
        Err(anyhow!(
            "message backend is unavailable; dropped document {document_id}"
        ))
    }

    async fn subscribe_changes(&self) -> Result<broadcast::Receiver<ListenEvent>> {
        Err(anyhow!("message backend is unavailable"))
    }
}

/// Authenticated context for the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
}

pub struct SessionController {
    identity: Arc<dyn IdentityProvider>,
}

impl SessionController {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }

    /// Resolve the authenticated session: a cached identity wins, otherwise
    /// the delegated sign-in flow runs exactly once. Any failure or
    /// cancellation is logged and absorbed; the caller stays signed out.
    pub async fn establish(&self) -> Option<Session> {
        match self.identity.current_user().await {
            Ok(Some(profile)) => {
                debug!(user_id = %profile.user_id, "session: user already signed in");
                return Some(session_for(&profile));
            }
            Ok(None) => debug!("session: no user signed in; starting sign-in flow"),
            Err(err) => {
                warn!("session: identity state lookup failed: {err:#}");
                return None;
            }
        }

        match self.identity.begin_sign_in().await {
            Ok(SignInOutcome::Completed(_)) => {
                // Re-query so the session reflects what the provider stored.
                match self.identity.current_user().await {
                    Ok(Some(profile)) => {
                        info!(user_id = %profile.user_id, "session: sign-in completed");
                        Some(session_for(&profile))
                    }
                    Ok(None) => {
                        warn!("session: sign-in reported success but no user is present");
                        None
                    }
                    Err(err) => {
                        warn!("session: identity re-query failed after sign-in: {err:#}");
                        None
                    }
                }
            }
            Ok(SignInOutcome::Cancelled) => {
                info!("session: sign-in cancelled");
                None
            }
            Ok(SignInOutcome::Failed(err)) => {
                warn!(code = ?err.code, "session: sign-in failed: {}", err.message);
                None
            }
            Err(err) => {
                warn!("session: sign-in flow failed to run: {err:#}");
                None
            }
        }
    }
}

fn session_for(profile: &UserProfile) -> Session {
    Session {
        username: profile
            .display_name
            .clone()
            .unwrap_or_else(|| ANONYMOUS.to_string()),
    }
}

/// One message as held by the local feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub document_id: DocumentId,
    pub record: MessageRecord,
    pub received_at: DateTime<Utc>,
}

/// Updates pushed to feed observers, one per applied delta.
#[derive(Debug, Clone)]
pub enum FeedUpdate {
    Appended(FeedEntry),
    Replaced(FeedEntry),
    Removed(DocumentId),
    /// The subscription reported an error. It is not retried.
    Error(String),
}

/// View state owned by the feed controller: the ordered message list plus
/// the ids already applied, so redelivered adds stay idempotent.
#[derive(Debug, Default)]
pub struct FeedState {
    entries: Vec<FeedEntry>,
    seen: HashSet<DocumentId>,
}

impl FeedState {
    pub fn entries(&self) -> &[FeedEntry] {
        &self.entries
    }

    fn apply(&mut self, change: DocumentChange, received_at: DateTime<Utc>) -> Option<FeedUpdate> {
        let DocumentChange {
            kind,
            document_id,
            record,
        } = change;
        match kind {
            ChangeKind::Added => {
                if !self.seen.insert(document_id.clone()) {
                    debug!(document_id = %document_id, "feed: duplicate add ignored");
                    return None;
                }
                let entry = FeedEntry {
                    document_id,
                    record,
                    received_at,
                };
                self.entries.push(entry.clone());
                Some(FeedUpdate::Appended(entry))
            }
            ChangeKind::Modified => match self
                .entries
                .iter_mut()
                .find(|entry| entry.document_id == document_id)
            {
                Some(entry) => {
                    entry.record = record;
                    Some(FeedUpdate::Replaced(entry.clone()))
                }
                None => {
                    debug!(document_id = %document_id, "feed: modify for unknown document ignored");
                    None
                }
            },
            ChangeKind::Removed => {
                let before = self.entries.len();
                self.entries.retain(|entry| entry.document_id != document_id);
                if self.entries.len() == before {
                    debug!(document_id = %document_id, "feed: remove for unknown document ignored");
                    return None;
                }
                self.seen.remove(&document_id);
                Some(FeedUpdate::Removed(document_id))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message text is empty after trimming")]
    Empty,
    #[error("message text exceeds {MESSAGE_LENGTH_LIMIT} characters")]
    TooLong,
    #[error("failed to append message to the remote collection: {0:#}")]
    Backend(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("failed to open the live subscription: {0:#}")]
    Backend(anyhow::Error),
}

/// Owns the subscription task; aborting on drop guarantees the listener is
/// released when the controller goes away.
struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct FeedController {
    backend: Arc<dyn MessageBackend>,
    username: String,
    state: Arc<Mutex<FeedState>>,
    updates: broadcast::Sender<FeedUpdate>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl FeedController {
    pub fn new(backend: Arc<dyn MessageBackend>, session: &Session) -> Self {
        let (updates, _) = broadcast::channel(FEED_UPDATE_BUFFER);
        Self {
            backend,
            username: session.username.clone(),
            state: Arc::new(Mutex::new(FeedState::default())),
            updates,
            subscription: Mutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<FeedEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn is_live(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    /// Acquire the live subscription. Idempotent: while one is held, later
    /// calls are no-ops, so a session gets exactly one listener.
    pub async fn attach(&self) -> Result<(), SubscribeError> {
        let mut guard = self.subscription.lock().await;
        if guard.is_some() {
            debug!("feed: subscription already established; ignoring duplicate attach");
            return Ok(());
        }

        let mut changes = self
            .backend
            .subscribe_changes()
            .await
            .map_err(SubscribeError::Backend)?;
        let state = Arc::clone(&self.state);
        let updates = self.updates.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(ListenEvent::Changes { batch }) => {
                        apply_batch(&state, &updates, batch).await;
                    }
                    Ok(ListenEvent::Error(err)) => {
                        warn!(code = ?err.code, "feed: subscription error: {}", err.message);
                        let _ = updates.send(FeedUpdate::Error(err.to_string()));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "feed: change stream lagged; deltas were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("feed: change stream closed");
                        break;
                    }
                }
            }
        });

        *guard = Some(SubscriptionHandle { task });
        info!("feed: live subscription established");
        Ok(())
    }

    /// Release the subscription. The held task is aborted by the handle.
    pub async fn detach(&self) {
        let mut guard = self.subscription.lock().await;
        if guard.take().is_some() {
            info!("feed: live subscription released");
        }
    }

    /// Append an outgoing message to the remote collection. No local echo:
    /// the entry shows up once the subscription delivers it back.
    pub async fn send(&self, text: &str) -> Result<DocumentId, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::Empty);
        }
        if text.chars().count() > MESSAGE_LENGTH_LIMIT {
            return Err(SendError::TooLong);
        }

        let document_id = DocumentId::random();
        let record = MessageRecord {
            text: text.to_string(),
            name: self.username.clone(),
            photo_url: None,
        };
        self.backend
            .append(document_id.clone(), record)
            .await
            .map_err(SendError::Backend)?;
        debug!(document_id = %document_id, "feed: message appended to remote collection");
        Ok(document_id)
    }
}

async fn apply_batch(
    state: &Mutex<FeedState>,
    updates: &broadcast::Sender<FeedUpdate>,
    batch: ChangeBatch,
) {
    let received_at = Utc::now();
    let mut feed = state.lock().await;
    for change in batch.changes {
        if let Some(update) = feed.apply(change, received_at) {
            let _ = updates.send(update);
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
