use crate::errdata;
use crate::error::Result;

use serde_json::Value;
use uuid::Uuid;

/// Identifies a tracked follower: the object id it sent in its handshake,
/// plus the full row document persisted for it in the slaves collection
/// (the remote identity fields, the member config it handshook with, and
/// the oplog namespace it tails).
///
/// Ordering and equality consider the `_id` object id alone, so two idents
/// with the same `_id` collapse to a single map entry even when their
/// configs differ. This keeps a follower's identity stable across
/// reconnects, but it also means a reused `_id` silently folds into the
/// older entry's row document.
#[derive(Clone, Debug)]
pub struct SlaveIdent {
    /// The object id extracted from the remote identity document.
    id: Uuid,
    /// The merged row document.
    doc: Value,
}

impl SlaveIdent {
    /// Builds an identity from a follower's remote identity document, its
    /// member config, and the oplog namespace it is tailing. Errors if the
    /// remote identity is not a document carrying an `_id` object id.
    pub fn new(rid: &Value, config: &Value, ns: &str) -> Result<Self> {
        let Some(fields) = rid.as_object() else {
            return errdata!("remote identity is not a document: {rid}");
        };
        let id = match rid.get("_id").and_then(Value::as_str).map(Uuid::parse_str) {
            Some(Ok(id)) => id,
            Some(Err(_)) | None => {
                return errdata!("remote identity has no _id object id: {rid}")
            }
        };
        let mut doc = fields.clone();
        doc.insert("config".into(), config.clone());
        doc.insert("ns".into(), ns.into());
        Ok(Self { id, doc: Value::Object(doc) })
    }

    /// The follower's object id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The full row document persisted to the slaves collection.
    pub fn doc(&self) -> &Value {
        &self.doc
    }

    /// The member config the follower handshook with.
    pub fn config(&self) -> &Value {
        &self.doc["config"]
    }
}

impl PartialEq for SlaveIdent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SlaveIdent {}

impl PartialOrd for SlaveIdent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlaveIdent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
