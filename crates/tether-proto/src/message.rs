// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server and client message envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_tree::{FeatureId, NodeChange, NodeId};

use crate::codec::{decode_changes, encode_changes};
use crate::error::DecodeError;
use crate::framing::wrap;

/// Server-to-client message sequence number.
pub type SyncId = u64;
/// Client-to-server message sequence number (`clientId` on the wire).
pub type ClientSeq = u64;

/// Optional response metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Message was pushed by the server rather than answering a request.
    pub is_async: bool,
    /// Server-side timing samples in milliseconds.
    pub timings: Option<Vec<u64>>,
}

impl ResponseMeta {
    /// Metadata for a server push.
    pub fn pushed() -> Self {
        Self {
            is_async: true,
            timings: None,
        }
    }

    fn is_default(&self) -> bool {
        !self.is_async && self.timings.is_none()
    }
}

/// One server-to-client batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Sequence number; `0` for the first message of a session.
    pub sync_id: SyncId,
    /// Next client sequence number the server expects, when answering a request.
    pub client_id: Option<ClientSeq>,
    /// The batch is a full state snapshot that replaces the mirror.
    pub resynchronize: bool,
    /// Metadata.
    pub meta: ResponseMeta,
    /// Ordered change records.
    pub changes: Vec<NodeChange>,
}

impl ServerMessage {
    /// Incremental batch.
    pub fn delta(sync_id: SyncId, changes: Vec<NodeChange>) -> Self {
        Self {
            sync_id,
            client_id: None,
            resynchronize: false,
            meta: ResponseMeta::default(),
            changes,
        }
    }

    /// Snapshot batch.
    pub fn snapshot(sync_id: SyncId, changes: Vec<NodeChange>) -> Self {
        Self {
            resynchronize: true,
            ..Self::delta(sync_id, changes)
        }
    }

    /// JSON object form. Keys are inserted in sorted order so the text is
    /// identical with or without serde_json's `preserve_order`.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("changes".into(), encode_changes(&self.changes));
        if let Some(client_id) = self.client_id {
            obj.insert("clientId".into(), client_id.into());
        }
        if !self.meta.is_default() {
            let mut meta = Map::new();
            if self.meta.is_async {
                meta.insert("async".into(), true.into());
            }
            if let Some(timings) = &self.meta.timings {
                meta.insert(
                    "timings".into(),
                    Value::Array(timings.iter().map(|t| Value::from(*t)).collect()),
                );
            }
            obj.insert("meta".into(), Value::Object(meta));
        }
        if self.resynchronize {
            obj.insert("resynchronize".into(), true.into());
        }
        obj.insert("syncId".into(), self.sync_id.into());
        Value::Object(obj)
    }

    /// Parses the JSON object form.
    pub fn from_json(value: &Value) -> Result<Self, DecodeError> {
        let obj = value
            .as_object()
            .ok_or(DecodeError::NotAnObject("message"))?;
        let sync_id = obj
            .get("syncId")
            .ok_or(DecodeError::MissingField("syncId"))?
            .as_u64()
            .ok_or_else(|| invalid("syncId"))?;
        let client_id = match obj.get("clientId") {
            None => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| invalid("clientId"))?),
        };
        let resynchronize = match obj.get("resynchronize") {
            None => false,
            Some(v) => v.as_bool().ok_or_else(|| invalid("resynchronize"))?,
        };
        let meta = match obj.get("meta") {
            None => ResponseMeta::default(),
            Some(v) => {
                let meta = v.as_object().ok_or(DecodeError::NotAnObject("meta"))?;
                ResponseMeta {
                    is_async: meta.get("async").and_then(Value::as_bool).unwrap_or(false),
                    timings: match meta.get("timings") {
                        None => None,
                        Some(t) => Some(
                            t.as_array()
                                .ok_or_else(|| invalid("timings"))?
                                .iter()
                                .map(|n| n.as_u64().ok_or_else(|| invalid("timings")))
                                .collect::<Result<_, _>>()?,
                        ),
                    },
                }
            }
        };
        let changes = decode_changes(
            obj.get("changes")
                .ok_or(DecodeError::MissingField("changes"))?,
        )?;
        Ok(Self {
            sync_id,
            client_id,
            resynchronize,
            meta,
            changes,
        })
    }

    /// Compact JSON text.
    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }

    /// JSON text wrapped as `for(;;);[...]`.
    pub fn encode_wrapped(&self) -> String {
        wrap(&self.encode())
    }
}

fn invalid(field: &'static str) -> DecodeError {
    DecodeError::InvalidField {
        field,
        reason: "unexpected type".to_owned(),
    }
}

/// A value the client proposes for a map entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEdit {
    /// Target node.
    pub node: NodeId,
    /// Target map feature.
    pub feature: FeatureId,
    /// Map key.
    #[serde(rename = "property")]
    pub key: String,
    /// Proposed value.
    pub value: Value,
}

/// One client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    /// Client sequence number of this message.
    pub client_id: ClientSeq,
    /// Last server sync id the client applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<SyncId>,
    /// Client asks for a full snapshot.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resynchronize: bool,
    /// Pending edits in the order they were made.
    #[serde(default)]
    pub rpc: Vec<ClientEdit>,
}

impl ClientMessage {
    /// JSON text.
    pub fn encode(&self) -> Result<String, DecodeError> {
        serde_json::to_string(self).map_err(|e| DecodeError::Json(e.to_string()))
    }

    /// Parses JSON text.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_message_json_is_stable() {
        let msg = ServerMessage {
            sync_id: 4,
            client_id: Some(2),
            resynchronize: false,
            meta: ResponseMeta {
                is_async: true,
                timings: Some(vec![3, 1]),
            },
            changes: vec![NodeChange::Attach { node: 1 }],
        };
        assert_eq!(
            msg.encode(),
            concat!(
                r#"{"changes":[{"node":1,"type":"attach"}],"clientId":2,"#,
                r#""meta":{"async":true,"timings":[3,1]},"syncId":4}"#
            )
        );
        assert_eq!(ServerMessage::from_json(&msg.to_json()).unwrap(), msg);
    }

    #[test]
    fn missing_sync_id_is_rejected() {
        assert_eq!(
            ServerMessage::from_json(&json!({"changes": []})),
            Err(DecodeError::MissingField("syncId"))
        );
    }

    #[test]
    fn client_message_uses_camel_case_keys() {
        let msg = ClientMessage {
            client_id: 3,
            sync_id: Some(9),
            resynchronize: false,
            rpc: vec![ClientEdit {
                node: 5,
                feature: 0,
                key: "value".into(),
                value: json!("typed"),
            }],
        };
        let text = msg.encode().unwrap();
        assert_eq!(
            text,
            concat!(
                r#"{"clientId":3,"syncId":9,"#,
                r#""rpc":[{"node":5,"feature":0,"property":"value","value":"typed"}]}"#
            )
        );
        assert_eq!(ClientMessage::decode(&text).unwrap(), msg);
        let bare = ClientMessage::decode(r#"{"clientId":0}"#).unwrap();
        assert!(bare.rpc.is_empty() && !bare.resynchronize);
    }
}
