//! Scripted in-process server for tests
//!
//! Implements `Transport` over an in-memory entity table. Mutations are
//! deduplicated by `mutationId` the way the real server is expected to,
//! bookmarks get sequential `bm-N` ids, and failures can be scripted per
//! request.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::{datetime_from_ms, EntityKind};
use crate::transport::{Method, Response, Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

enum Script {
    Fail(TransportError),
    ApplyThenFail(TransportError),
}

#[derive(Default)]
struct ServerState {
    offline: bool,
    requests: Vec<RecordedRequest>,
    scripts: VecDeque<Script>,
    seen: HashMap<Uuid, Result<Response, TransportError>>,
    applied: Vec<Uuid>,
    entities: BTreeMap<(EntityKind, String), Value>,
    next_bookmark: u64,
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().offline = !online;
    }

    /// Fail the next mutation request without applying it
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().scripts.push_back(Script::Fail(error));
    }

    /// Apply the next mutation but lose the response
    pub fn apply_then_fail_next(&self, error: TransportError) {
        self.state
            .lock()
            .scripts
            .push_back(Script::ApplyThenFail(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Envelopes of every mutation request, in arrival order
    pub fn mutation_bodies(&self) -> Vec<Value> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method != Method::Get)
            .filter_map(|r| r.body.clone())
            .collect()
    }

    /// Mutation ids applied, each listed once
    pub fn applied(&self) -> Vec<Uuid> {
        self.state.lock().applied.clone()
    }

    /// Write an entity directly, as another device would
    pub fn put_entity(&self, kind: EntityKind, key: &str, value: Value) {
        self.state
            .lock()
            .entities
            .insert((kind, key.to_string()), value);
    }

    pub fn remove_entity(&self, kind: EntityKind, key: &str) {
        self.state.lock().entities.remove(&(kind, key.to_string()));
    }

    pub fn entity(&self, kind: EntityKind, key: &str) -> Option<Value> {
        self.state
            .lock()
            .entities
            .get(&(kind, key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, TransportError> {
        let mut state = self.state.lock();
        state.requests.push(RecordedRequest {
            method,
            path: path.to_string(),
            body: body.clone(),
        });

        if state.offline {
            return Err(TransportError::Network("connection refused".to_string()));
        }

        let (kind, id) = parse_path(path)?;
        let Some(kind) = kind else {
            return Ok(Response::ok(json!({"status": "ok"})));
        };

        if method == Method::Get {
            let items: Vec<Value> = state
                .entities
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|(_, v)| v.clone())
                .collect();
            return Ok(Response::ok(Value::Array(items)));
        }

        let body = body.unwrap_or(Value::Null);
        let mutation_id = body["mutationId"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| TransportError::http(400))?;

        let script = state.scripts.pop_front();
        if let Some(Script::Fail(error)) = script {
            return Err(error);
        }

        let previous = state.seen.get(&mutation_id).cloned();
        let result = match previous {
            Some(previous) => previous,
            None => {
                let result = apply(&mut state, kind, method, id.as_deref(), &body);
                state.applied.push(mutation_id);
                state.seen.insert(mutation_id, result.clone());
                result
            }
        };

        match script {
            Some(Script::ApplyThenFail(error)) => Err(error),
            _ => result,
        }
    }
}

fn parse_path(path: &str) -> Result<(Option<EntityKind>, Option<String>), TransportError> {
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let kind = match segments.next() {
        Some("health") => None,
        Some("progress") => Some(EntityKind::Progress),
        Some("bookshelf") => Some(EntityKind::Bookshelf),
        Some("bookmarks") => Some(EntityKind::Bookmark),
        Some("history") => Some(EntityKind::History),
        _ => return Err(TransportError::http(404)),
    };
    Ok((kind, segments.next().map(str::to_string)))
}

fn apply(
    state: &mut ServerState,
    kind: EntityKind,
    method: Method,
    id: Option<&str>,
    body: &Value,
) -> Result<Response, TransportError> {
    let data = body["data"].as_object().cloned().unwrap_or_default();
    let at = json!(datetime_from_ms(body["localTimestamp"].as_u64().unwrap_or(0)));
    let device = body["deviceId"].clone();

    let key = match (kind, method, id) {
        (_, _, Some(id)) => id.to_string(),
        (EntityKind::Bookmark, Method::Post, None) => {
            state.next_bookmark += 1;
            format!("bm-{}", state.next_bookmark)
        }
        (_, _, None) => data
            .get("bookId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::http(400))?,
    };
    let slot = (kind, key.clone());
    let existing = state.entities.get(&slot).cloned();

    if method == Method::Delete {
        return match state.entities.remove(&slot) {
            Some(_) => Ok(Response::no_content()),
            None if kind == EntityKind::History => Ok(Response::no_content()),
            None => Err(TransportError::http(404)),
        };
    }

    let entity = match kind {
        EntityKind::Progress => json!({
            "bookId": key,
            "chapterId": data.get("chapterId"),
            "offset": data.get("offset"),
            "percentage": data.get("percentage"),
            "updatedAt": at,
            "sourceDeviceId": device,
        }),
        EntityKind::Bookshelf => {
            if method == Method::Put && existing.is_none() {
                return Err(TransportError::http(404));
            }
            let added_at = existing
                .as_ref()
                .map(|e| e["addedAt"].clone())
                .unwrap_or_else(|| at.clone());
            json!({
                "bookId": key,
                "status": data.get("status"),
                "addedAt": added_at,
                "updatedAt": at,
            })
        }
        EntityKind::Bookmark => match (method, existing) {
            (Method::Post, _) => {
                let mut entity = Map::new();
                entity.insert("id".to_string(), json!(key));
                for field in ["bookId", "chapterId", "position", "note", "highlightText"] {
                    if let Some(value) = data.get(field) {
                        entity.insert(field.to_string(), value.clone());
                    }
                }
                entity.insert("createdAt".to_string(), at.clone());
                entity.insert("updatedAt".to_string(), at);
                Value::Object(entity)
            }
            (_, Some(mut entity)) => {
                for field in ["bookId", "chapterId", "position", "note", "highlightText"] {
                    if let Some(value) = data.get(field) {
                        entity[field] = value.clone();
                    }
                }
                entity["updatedAt"] = at;
                entity
            }
            (_, None) => return Err(TransportError::http(404)),
        },
        EntityKind::History => json!({
            "bookId": key,
            "chapterId": data.get("chapterId"),
            "lastReadAt": at,
            "updatedAt": at,
            "sourceDeviceId": device,
        }),
    };

    state.entities.insert(slot, entity.clone());
    Ok(Response::ok(entity))
}
