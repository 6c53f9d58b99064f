//! REST mapping of queued mutations
//!
//! Every mutation goes out as an envelope carrying its id so the server
//! can drop duplicates of an at-least-once delivery:
//!
//! ```json
//! { "mutationId": "...", "deviceId": "...", "localTimestamp": 0, "op": "update", "data": {} }
//! ```

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::models::{EntityKind, MutationOp, MutationRecord};
use crate::transport::Method;

/// A request ready for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// Collection path of a family
pub fn list_path(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Progress => "/progress",
        EntityKind::Bookshelf => "/bookshelf",
        EntityKind::Bookmark => "/bookmarks",
        EntityKind::History => "/history",
    }
}

/// Build the request for one queued mutation
pub fn mutation_request(record: &MutationRecord, device_id: &str) -> Request {
    let base = list_path(record.entity_kind);
    let key = record.entity_key.as_str();

    let (method, path) = match (record.entity_kind, record.op) {
        (_, MutationOp::Delete) => (Method::Delete, format!("{}/{}", base, key)),
        (EntityKind::Bookshelf | EntityKind::Bookmark, MutationOp::Create) => {
            (Method::Post, base.to_string())
        }
        _ => (Method::Put, format!("{}/{}", base, key)),
    };

    let mut data = match &record.payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    match record.entity_kind {
        EntityKind::Bookmark if record.op == MutationOp::Create => {
            data.insert("clientId".to_string(), Value::String(key.to_string()));
        }
        EntityKind::Bookmark => {}
        _ => {
            data.insert("bookId".to_string(), Value::String(key.to_string()));
        }
    }

    let body = json!({
        "mutationId": record.id,
        "deviceId": device_id,
        "localTimestamp": record.local_timestamp,
        "op": record.op,
        "data": Value::Object(data),
    });

    Request {
        method,
        path,
        body: Some(body),
    }
}

/// Decode the entity returned by a mutation endpoint
///
/// Accepts either the bare entity or one wrapped in `{"data": ...}`.
pub fn parse_entity<E: DeserializeOwned>(body: Option<&Value>) -> Option<E> {
    let body = body?;
    let value = match body.get("data") {
        Some(inner) if inner.is_object() => inner,
        _ => body,
    };
    match serde_json::from_value(value.clone()) {
        Ok(entity) => Some(entity),
        Err(e) => {
            warn!("Unreadable entity in response: {}", e);
            None
        }
    }
}

/// Decode a list endpoint response
///
/// Accepts a bare array or `{"items": [...]}`. Items that fail to decode
/// are skipped.
pub fn parse_list<E: DeserializeOwned>(body: Option<&Value>) -> Vec<E> {
    let items: &[Value] = match body {
        Some(Value::Array(items)) => items.as_slice(),
        Some(value) => match value.get("items") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        None => &[],
    };

    let mut skipped = 0;
    let entities: Vec<E> = items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(entity) => Some(entity),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .collect();
    if skipped > 0 {
        warn!("Skipped {} unreadable list items", skipped);
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bookmark, BookshelfEntry, ShelfStatus};

    fn record(kind: EntityKind, key: &str, op: MutationOp, payload: Value) -> MutationRecord {
        MutationRecord::new(kind, key, op, payload, 1_234)
    }

    #[test]
    fn test_request_routes() {
        let cases = [
            (EntityKind::Progress, MutationOp::Update, Method::Put, "/progress/b1"),
            (EntityKind::Bookshelf, MutationOp::Create, Method::Post, "/bookshelf"),
            (EntityKind::Bookshelf, MutationOp::Update, Method::Put, "/bookshelf/b1"),
            (EntityKind::Bookshelf, MutationOp::Delete, Method::Delete, "/bookshelf/b1"),
            (EntityKind::Bookmark, MutationOp::Create, Method::Post, "/bookmarks"),
            (EntityKind::Bookmark, MutationOp::Update, Method::Put, "/bookmarks/b1"),
            (EntityKind::History, MutationOp::Update, Method::Put, "/history/b1"),
            (EntityKind::History, MutationOp::Delete, Method::Delete, "/history/b1"),
        ];
        for (kind, op, method, path) in cases {
            let request = mutation_request(&record(kind, "b1", op, Value::Null), "dev");
            assert_eq!(request.method, method, "{} {}", kind, op);
            assert_eq!(request.path, path);
        }
    }

    #[test]
    fn test_envelope() {
        let rec = record(
            EntityKind::Progress,
            "b1",
            MutationOp::Update,
            json!({"chapterId": "c1", "offset": 3, "percentage": 0.5}),
        );
        let body = mutation_request(&rec, "device-a").body.unwrap();

        assert_eq!(body["mutationId"], json!(rec.id));
        assert_eq!(body["deviceId"], "device-a");
        assert_eq!(body["localTimestamp"], 1_234);
        assert_eq!(body["op"], "update");
        assert_eq!(body["data"]["bookId"], "b1");
        assert_eq!(body["data"]["chapterId"], "c1");
    }

    #[test]
    fn test_bookmark_create_carries_client_id() {
        let rec = record(
            EntityKind::Bookmark,
            "tmp-1",
            MutationOp::Create,
            json!({"bookId": "b1"}),
        );
        let body = mutation_request(&rec, "d").body.unwrap();
        assert_eq!(body["data"]["clientId"], "tmp-1");
        assert_eq!(body["data"]["bookId"], "b1");
    }

    #[test]
    fn test_parse_entity_bare_and_wrapped() {
        let entry = json!({
            "bookId": "b1",
            "status": "reading",
            "addedAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z"
        });
        let bare: BookshelfEntry = parse_entity(Some(&entry)).unwrap();
        assert_eq!(bare.status, ShelfStatus::Reading);

        let wrapped = json!({ "data": entry });
        assert!(parse_entity::<BookshelfEntry>(Some(&wrapped)).is_some());
        assert!(parse_entity::<BookshelfEntry>(None).is_none());
        assert!(parse_entity::<BookshelfEntry>(Some(&json!({"ok": true}))).is_none());
    }

    #[test]
    fn test_parse_list_shapes() {
        let bookmark = json!({
            "id": "bm-1",
            "bookId": "b1",
            "chapterId": "c1",
            "position": 10,
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z"
        });

        let bare = json!([bookmark.clone(), {"broken": true}]);
        assert_eq!(parse_list::<Bookmark>(Some(&bare)).len(), 1);

        let wrapped = json!({ "items": [bookmark] });
        assert_eq!(parse_list::<Bookmark>(Some(&wrapped)).len(), 1);
        assert!(parse_list::<Bookmark>(None).is_empty());
    }
}
