use serde::{Deserialize, Serialize};

use crate::{domain::DocumentId, error::ApiError};

/// Name of the remote collection holding chat messages.
pub const MESSAGES_COLLECTION: &str = "messages";

/// One chat message as persisted by the hosted collection. Field names on
/// the wire are `text`, `name` and `photoUrl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub text: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One delta against the subscribed collection. The record is present for
/// every kind; a removal carries the document's last known contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document_id: DocumentId,
    pub record: MessageRecord,
}

/// Deltas delivered together by one push from the live subscription,
/// reflecting the difference since the previous batch, in backend order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<DocumentChange>,
}

/// Frames pushed over an open listen stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ListenEvent {
    Changes { batch: ChangeBatch },
    Error(ApiError),
}
