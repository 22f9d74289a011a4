//! Frames exchanged with the change-notification server.
//!
//! Every frame is a [`WsEnvelope`]: `{ id, type, data, ts, correlation_id? }`.
//! A server reply to a client frame (login or subscribe acknowledgement)
//! carries the client frame's `id` as its `correlation_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;
use crate::models::{document_id, id_string, ChangeEvent, Document, OperationKind, ResourceKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }

    /// Build a frame answering the frame with id `correlation_id`.
    pub fn reply_to(correlation_id: impl Into<String>, payload: T) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::new(payload)
        }
    }
}

/// Login message sent after the server greets the client.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoginPayload {
    pub alias: String,
    pub secret_key: String,
    #[serde(default)]
    pub data: String,
}

impl fmt::Debug for LoginPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginPayload")
            .field("alias", &self.alias)
            .field("secret_key", &"<redacted>")
            .field("data", &self.data)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "login")]
    Login(LoginPayload),
    #[serde(rename = "subscribe-collection")]
    SubscribeCollection(ResourceKey),
}

/// Acknowledgement of a `subscribe-collection` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Sent once the socket is open; the payload is opaque.
    #[serde(rename = "greeting")]
    Greeting(Option<Value>),
    #[serde(rename = "login-ack")]
    LoginAck,
    #[serde(rename = "login-error")]
    LoginError { message: String },
    #[serde(rename = "ack")]
    Ack(SubscribeAck),
    #[serde(rename = "changed-collection")]
    ChangedCollection(ChangedCollection),
}

/// Namespace of a change notification: database and collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentKey {
    #[serde(alias = "_id")]
    pub id: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Document,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_fields: Vec<String>,
}

/// Payload of a `changed-collection` push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangedCollection {
    pub operation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<DocumentKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
    pub ns: Namespace,
}

impl ChangedCollection {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.ns.db.clone(), self.ns.coll.clone())
    }

    /// Resolve the raw notification into a [`ChangeEvent`].
    pub fn into_change_event(self) -> Result<ChangeEvent, ProtocolError> {
        let kind = OperationKind::parse(&self.operation_type)
            .ok_or_else(|| ProtocolError::UnknownOperation(self.operation_type.clone()))?;
        let key = self.resource_key();

        let document_id = self
            .document_key
            .as_ref()
            .and_then(|k| id_string(&k.id))
            .or_else(|| self.full_document.as_ref().and_then(document_id))
            .ok_or_else(|| ProtocolError::MissingDocumentId(self.operation_type.clone()))?;

        let (updated_fields, removed_fields) = match self.update_description {
            Some(desc) => (Some(desc.updated_fields), desc.removed_fields),
            None => (None, Vec::new()),
        };

        Ok(ChangeEvent {
            key,
            kind,
            document_id,
            full_document: self.full_document,
            updated_fields,
            removed_fields,
        })
    }
}
