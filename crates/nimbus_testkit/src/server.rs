//! In-memory REST server.
//!
//! [`MemoryServer`] implements [`Transport`] by serving the REST routes
//! the client uses straight from memory:
//!
//! | Route | Methods |
//! |-------|---------|
//! | `/classes/<C>` | GET (query, count), POST (create) |
//! | `/classes/<C>/<id>` | GET, PUT, DELETE |
//! | `/aggregate/<C>` | GET (`distinct`, `pipeline`) |
//! | `/files/<name>` | POST |
//!
//! Records are stored in their wire form. Object ids are sequential, so
//! id order is creation order, and timestamps come from a logical clock
//! that advances one second per write.

use crate::matcher::{field_value, sort_records, Matcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_client::{Body, ErrorCode, Method, Request, Response, Transport, TransportError};
use nimbus_codec::{decode_map, format_iso, from_wire, to_wire, Json, Value};
use nimbus_core::keys::{self, CREATED_AT, OBJECT_ID, UPDATED_AT};
use nimbus_core::Operation;
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Base URL of stored files.
pub const FILES_URL: &str = "http://files.nimbus.test";

/// Results returned by a query without a limit.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Start of the logical clock: 2024-01-01T00:00:00Z.
const CLOCK_EPOCH: i64 = 1_704_067_200;

/// A stored record in wire form.
pub(crate) type Record = Map<String, Json>;

/// Relation memberships keyed by (owner class, owner id, key).
type RelationKey = (String, String, String);

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) classes: BTreeMap<String, BTreeMap<String, Record>>,
    pub(crate) relations: BTreeMap<RelationKey, BTreeSet<String>>,
    files: BTreeMap<String, (String, Vec<u8>)>,
    next_id: u64,
    ticks: i64,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        DateTime::from_timestamp(CLOCK_EPOCH + self.ticks, 0).unwrap_or_default()
    }

    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!("obj{:07}", self.next_id)
    }

    pub(crate) fn records(&self, class_name: &str) -> impl Iterator<Item = &Record> {
        self.classes
            .get(class_name)
            .into_iter()
            .flat_map(|records| records.values())
    }

    pub(crate) fn related(&self, class_name: &str, id: &str, key: &str) -> Option<&BTreeSet<String>> {
        self.relations
            .get(&(class_name.to_string(), id.to_string(), key.to_string()))
    }
}

fn error(status: u16, code: ErrorCode, message: impl Into<String>) -> Response {
    Response::error(status, i64::from(code.code()), message)
}

fn not_found() -> Response {
    error(404, ErrorCode::ObjectNotFound, "Object not found.")
}

/// Reads a GET parameter that may have arrived as a JSON string.
fn object_param(params: &Map<String, Json>, name: &str) -> Result<Map<String, Json>, Response> {
    match params.get(name) {
        None | Some(Json::Null) => Ok(Map::new()),
        Some(Json::Object(map)) => Ok(map.clone()),
        Some(Json::String(text)) => match serde_json::from_str::<Json>(text) {
            Ok(Json::Object(map)) => Ok(map),
            _ => Err(error(400, ErrorCode::InvalidJson, format!("invalid {name}"))),
        },
        Some(_) => Err(error(400, ErrorCode::InvalidJson, format!("invalid {name}"))),
    }
}

fn number_param(params: &Map<String, Json>, name: &str) -> Result<Option<usize>, Response> {
    let parsed = match params.get(name) {
        None | Some(Json::Null) => return Ok(None),
        Some(Json::Number(n)) => n.as_u64(),
        Some(Json::String(s)) => s.parse::<u64>().ok(),
        Some(_) => None,
    };
    parsed
        .and_then(|n| usize::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| error(400, ErrorCode::InvalidQuery, format!("invalid {name}")))
}

fn list_param(params: &Map<String, Json>, name: &str) -> Vec<String> {
    params
        .get(name)
        .and_then(Json::as_str)
        .map(|s| {
            s.split(',')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn truthy(value: Option<&Json>) -> bool {
    match value {
        Some(Json::Bool(b)) => *b,
        Some(Json::Number(n)) => n.as_i64() != Some(0),
        Some(Json::String(s)) => s == "1" || s == "true",
        _ => false,
    }
}

/// Changes to apply once every operation of a write has succeeded.
struct Write {
    record: Record,
    echo: Map<String, Json>,
    relation_changes: Vec<(String, Operation)>,
}

/// An in-memory stand-in for the REST server.
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<State>,
    requests: Mutex<Vec<Request>>,
}

impl MemoryServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record directly, bypassing the REST routes.
    ///
    /// `objectId`, `createdAt` and `updatedAt` are kept when present and
    /// assigned otherwise. Returns the object id.
    pub fn insert(&self, class_name: &str, record: Json) -> String {
        let mut state = self.state.lock();
        let mut record = match record {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        let id = match record.get(OBJECT_ID).and_then(Json::as_str) {
            Some(id) => id.to_string(),
            None => state.new_id(),
        };
        let now = format_iso(&state.tick());
        record.insert(OBJECT_ID.into(), Json::String(id.clone()));
        record
            .entry(CREATED_AT.to_string())
            .or_insert_with(|| Json::String(now.clone()));
        let created = record.get(CREATED_AT).cloned().unwrap_or(Json::String(now));
        record.entry(UPDATED_AT.to_string()).or_insert(created);
        state
            .classes
            .entry(class_name.to_string())
            .or_default()
            .insert(id.clone(), record);
        id
    }

    /// Overwrites one key of a stored record, as another client would.
    /// Returns false if the record does not exist.
    pub fn update(&self, class_name: &str, id: &str, key: &str, value: Json) -> bool {
        let mut state = self.state.lock();
        let now = format_iso(&state.tick());
        match state
            .classes
            .get_mut(class_name)
            .and_then(|records| records.get_mut(id))
        {
            Some(record) => {
                record.insert(key.to_string(), value);
                record.insert(UPDATED_AT.into(), Json::String(now));
                true
            }
            None => false,
        }
    }

    /// A stored record.
    pub fn record(&self, class_name: &str, id: &str) -> Option<Json> {
        self.state
            .lock()
            .classes
            .get(class_name)
            .and_then(|records| records.get(id))
            .map(|record| Json::Object(record.clone()))
    }

    /// Attributes of a stored record, decoded, without the identity and
    /// timestamp keys.
    pub fn attributes(&self, class_name: &str, id: &str) -> Option<BTreeMap<String, Value>> {
        let Json::Object(mut record) = self.record(class_name, id)? else {
            return None;
        };
        for key in [OBJECT_ID, CREATED_AT, UPDATED_AT] {
            record.remove(key);
        }
        decode_map(&record).ok()
    }

    /// Number of records of a class.
    pub fn len(&self, class_name: &str) -> usize {
        self.state
            .lock()
            .classes
            .get(class_name)
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if the class holds no records.
    pub fn is_empty(&self, class_name: &str) -> bool {
        self.len(class_name) == 0
    }

    /// Ids linked by a relation.
    pub fn related_ids(&self, class_name: &str, id: &str, key: &str) -> Vec<String> {
        self.state
            .lock()
            .related(class_name, id, key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Content of a stored file.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(name).map(|(_, data)| data.clone())
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Serves one request.
    pub fn handle(&self, request: &Request) -> Response {
        self.requests.lock().push(request.clone());
        let segments: Vec<&str> = request
            .path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let response = match (request.method, segments.as_slice()) {
            (Method::Get, ["classes", class_name]) => self.find(class_name, request.json()),
            (Method::Post, ["classes", class_name]) => self.create(class_name, request.json()),
            (Method::Get, ["classes", class_name, id]) => self.get(class_name, id),
            (Method::Put, ["classes", class_name, id]) => self.save(class_name, id, request.json()),
            (Method::Delete, ["classes", class_name, id]) => self.delete(class_name, id),
            (Method::Get, ["aggregate", class_name]) => self.aggregate(class_name, request.json()),
            (Method::Post, ["files", name]) => self.upload(name, request.body.as_ref()),
            _ => error(
                400,
                ErrorCode::InvalidQuery,
                format!("unsupported route {} {}", request.method, request.path),
            ),
        };
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status,
            "memory server"
        );
        response
    }

    fn apply_ops(&self, mut record: Record, body: Option<&Json>) -> Result<Write, Response> {
        let Some(Json::Object(ops)) = body else {
            return Err(error(400, ErrorCode::InvalidJson, "body must be a JSON object"));
        };
        let mut echo = Map::new();
        let mut relation_changes = Vec::new();
        for (key, wire) in ops {
            if matches!(key.as_str(), OBJECT_ID | CREATED_AT | UPDATED_AT) {
                return Err(error(
                    400,
                    ErrorCode::InvalidKeyName,
                    format!("{key} is reserved"),
                ));
            }
            let op = Operation::from_wire(wire)
                .map_err(|e| error(400, ErrorCode::InvalidJson, e.to_string()))?;
            let current = record
                .get(key)
                .map(from_wire)
                .transpose()
                .map_err(|e| error(400, ErrorCode::InvalidJson, e.to_string()))?;
            let next = op
                .apply(key, current.as_ref())
                .map_err(|e| error(400, ErrorCode::IncorrectType, e.to_string()))?;
            match next {
                Some(value) => {
                    let encoded =
                        to_wire(&value).map_err(|e| error(400, ErrorCode::InvalidJson, e.to_string()))?;
                    if !matches!(op, Operation::Set(_) | Operation::Relation(_)) {
                        echo.insert(key.clone(), encoded.clone());
                    }
                    record.insert(key.clone(), encoded);
                }
                None => {
                    record.remove(key);
                }
            }
            if matches!(op, Operation::Relation(_)) {
                relation_changes.push((key.clone(), op));
            }
        }
        Ok(Write {
            record,
            echo,
            relation_changes,
        })
    }

    fn commit_relations(state: &mut State, class_name: &str, id: &str, changes: Vec<(String, Operation)>) {
        for (key, op) in changes {
            let Operation::Relation(change) = op else {
                continue;
            };
            let members = state
                .relations
                .entry((class_name.to_string(), id.to_string(), key))
                .or_default();
            for added in change.added() {
                members.insert(added.clone());
            }
            for removed in change.removed() {
                members.remove(removed);
            }
        }
    }

    fn create(&self, class_name: &str, body: Option<&Json>) -> Response {
        if let Err(e) = keys::validate_class_name(class_name) {
            return error(400, ErrorCode::InvalidClassName, e.to_string());
        }
        let write = match self.apply_ops(Record::new(), body) {
            Ok(write) => write,
            Err(response) => return response,
        };
        let mut state = self.state.lock();
        let id = state.new_id();
        let now = format_iso(&state.tick());
        let mut record = write.record;
        record.insert(OBJECT_ID.into(), Json::String(id.clone()));
        record.insert(CREATED_AT.into(), Json::String(now.clone()));
        record.insert(UPDATED_AT.into(), Json::String(now.clone()));
        Self::commit_relations(&mut state, class_name, &id, write.relation_changes);
        state
            .classes
            .entry(class_name.to_string())
            .or_default()
            .insert(id.clone(), record);

        let mut body = write.echo;
        body.insert(OBJECT_ID.into(), Json::String(id));
        body.insert(CREATED_AT.into(), Json::String(now));
        Response::created(Json::Object(body))
    }

    fn save(&self, class_name: &str, id: &str, body: Option<&Json>) -> Response {
        let Some(Json::Object(existing)) = self.record(class_name, id) else {
            return not_found();
        };
        let write = match self.apply_ops(existing, body) {
            Ok(write) => write,
            Err(response) => return response,
        };
        let mut state = self.state.lock();
        let now = format_iso(&state.tick());
        let mut record = write.record;
        record.insert(UPDATED_AT.into(), Json::String(now.clone()));
        Self::commit_relations(&mut state, class_name, id, write.relation_changes);
        let Some(slot) = state
            .classes
            .get_mut(class_name)
            .and_then(|records| records.get_mut(id))
        else {
            return not_found();
        };
        *slot = record;

        let mut body = write.echo;
        body.insert(UPDATED_AT.into(), Json::String(now));
        Response::ok(Json::Object(body))
    }

    fn get(&self, class_name: &str, id: &str) -> Response {
        match self.record(class_name, id) {
            Some(record) => Response::ok(record),
            None => not_found(),
        }
    }

    fn delete(&self, class_name: &str, id: &str) -> Response {
        let mut state = self.state.lock();
        let removed = state
            .classes
            .get_mut(class_name)
            .and_then(|records| records.remove(id));
        match removed {
            Some(_) => {
                state
                    .relations
                    .retain(|(class, owner, _), _| !(class == class_name && owner == id));
                Response::ok(json!({}))
            }
            None => not_found(),
        }
    }

    fn find(&self, class_name: &str, body: Option<&Json>) -> Response {
        match self.try_find(class_name, body) {
            Ok(body) => Response::ok(body),
            Err(response) => response,
        }
    }

    fn try_find(&self, class_name: &str, body: Option<&Json>) -> Result<Json, Response> {
        let params = match body {
            Some(Json::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let clauses = object_param(&params, "where")?;
        let state = self.state.lock();

        let mut target = class_name.to_string();
        let redirect = params.get("redirectClassNameForKey").and_then(Json::as_str);
        if let (Some(key), Some(related)) = (redirect, clauses.get("$relatedTo")) {
            let owner = related.get("object").and_then(|o| from_wire(o).ok());
            if let Some(Value::Pointer(owner)) = owner {
                let stored = state
                    .classes
                    .get(&owner.class_name)
                    .and_then(|records| records.get(&owner.object_id))
                    .and_then(|record| record.get(key));
                if let Some(Value::Relation(class)) = stored.and_then(|v| from_wire(v).ok()) {
                    target = class;
                }
            }
        }

        let matcher = Matcher::new(&state);
        let mut matched = matcher
            .filter(&target, &clauses)
            .map_err(|message| error(400, ErrorCode::InvalidQuery, message))?;
        let order = list_param(&params, "order");
        sort_records(&mut matched, &order, &clauses);

        let total = matched.len();
        let skip = number_param(&params, "skip")?.unwrap_or(0);
        let limit = number_param(&params, "limit")?.unwrap_or(DEFAULT_QUERY_LIMIT);
        let select = list_param(&params, "keys");
        let include = list_param(&params, "include");

        let results: Vec<Json> = matched
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|record| {
                let mut record = record.clone();
                if !select.is_empty() {
                    record.retain(|key, _| {
                        matches!(key.as_str(), OBJECT_ID | CREATED_AT | UPDATED_AT)
                            || select.iter().any(|s| s == key || s.split('.').next() == Some(key))
                    });
                }
                for key in &include {
                    include_pointer(&state, &mut record, key);
                }
                Json::Object(record)
            })
            .collect();

        let mut response = Map::new();
        response.insert("results".into(), Json::Array(results));
        if truthy(params.get("count")) {
            response.insert("count".into(), json!(total));
        }
        if target != class_name {
            response.insert(keys::CLASS_NAME.into(), Json::String(target));
        }
        Ok(Json::Object(response))
    }

    fn aggregate(&self, class_name: &str, body: Option<&Json>) -> Response {
        match self.try_aggregate(class_name, body) {
            Ok(results) => Response::ok(json!({ "results": results })),
            Err(response) => response,
        }
    }

    fn try_aggregate(&self, class_name: &str, body: Option<&Json>) -> Result<Vec<Json>, Response> {
        let params = match body {
            Some(Json::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let state = self.state.lock();
        let matcher = Matcher::new(&state);
        let invalid = |message: String| error(400, ErrorCode::InvalidQuery, message);

        if let Some(key) = params.get("distinct").and_then(Json::as_str) {
            let clauses = object_param(&params, "where")?;
            let matched = matcher.filter(class_name, &clauses).map_err(invalid)?;
            let mut seen: Vec<Value> = Vec::new();
            for record in matched {
                if let Some(value) = field_value(record, key) {
                    if !seen.iter().any(|v| v.loosely_equals(&value)) {
                        seen.push(value);
                    }
                }
            }
            return seen
                .iter()
                .map(|v| to_wire(v).map_err(|e| invalid(e.to_string())))
                .collect();
        }

        let stages = match params.get("pipeline") {
            Some(Json::Array(stages)) => stages.clone(),
            Some(Json::Object(stage)) => vec![Json::Object(stage.clone())],
            _ => return Err(invalid("aggregate requires distinct or pipeline".into())),
        };
        let mut rows: Vec<Record> = state.records(class_name).cloned().collect();
        for stage in &stages {
            let Some((name, arg)) = stage.as_object().and_then(|s| s.iter().next()) else {
                return Err(invalid("empty pipeline stage".into()));
            };
            match name.trim_start_matches('$') {
                "match" => {
                    let clauses = arg.as_object().cloned().unwrap_or_default();
                    let mut kept = Vec::new();
                    for row in rows {
                        if matcher.matches(class_name, &row, &clauses).map_err(invalid)? {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                "sort" => {
                    let order: Vec<String> = arg
                        .as_object()
                        .map(|fields| {
                            fields
                                .iter()
                                .map(|(k, dir)| {
                                    if dir.as_i64() == Some(-1) {
                                        format!("-{k}")
                                    } else {
                                        k.clone()
                                    }
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    let mut refs: Vec<&Record> = rows.iter().collect();
                    sort_records(&mut refs, &order, &Map::new());
                    rows = refs.into_iter().cloned().collect();
                }
                "skip" => {
                    let n = arg.as_u64().and_then(|n| usize::try_from(n).ok()).unwrap_or(0);
                    rows = rows.into_iter().skip(n).collect();
                }
                "limit" => {
                    let n = arg
                        .as_u64()
                        .and_then(|n| usize::try_from(n).ok())
                        .unwrap_or(usize::MAX);
                    rows.truncate(n);
                }
                "group" => rows = group(&rows, arg).map_err(invalid)?,
                other => return Err(invalid(format!("unsupported stage {other}"))),
            }
        }
        Ok(rows.into_iter().map(Json::Object).collect())
    }

    fn upload(&self, name: &str, body: Option<&Body>) -> Response {
        let Some(Body::Bytes { content_type, data }) = body else {
            return error(400, ErrorCode::MissingContentType, "file body must be raw bytes");
        };
        let name = match urlencoding::decode(name) {
            Ok(name) => name.into_owned(),
            Err(e) => return error(400, ErrorCode::InvalidFileName, e.to_string()),
        };
        let mut state = self.state.lock();
        state.next_id += 1;
        let stored = format!("{:08x}_{name}", state.next_id);
        state
            .files
            .insert(stored.clone(), (content_type.clone(), data.clone()));
        let url = format!("{FILES_URL}/{}", urlencoding::encode(&stored));
        Response::created(json!({ "name": stored, "url": url }))
    }
}

/// Replaces a pointer under `key` with the full record it points to.
fn include_pointer(state: &State, record: &mut Record, key: &str) {
    let pointer = match record.get(key).map(from_wire) {
        Some(Ok(Value::Pointer(pointer))) => pointer,
        _ => return,
    };
    let Some(target) = state
        .classes
        .get(&pointer.class_name)
        .and_then(|records| records.get(&pointer.object_id))
    else {
        return;
    };
    let mut full = target.clone();
    full.insert("__type".into(), Json::String("Object".into()));
    full.insert(keys::CLASS_NAME.into(), Json::String(pointer.class_name));
    record.insert(key.to_string(), Json::Object(full));
}

/// `$group` with an `objectId` grouping expression and `$sum`
/// accumulators.
fn group(rows: &[Record], spec: &Json) -> Result<Vec<Record>, String> {
    let spec = spec.as_object().ok_or("group stage must be an object")?;
    let by = spec.get(OBJECT_ID).and_then(Json::as_str);
    let mut groups: Vec<(Option<Value>, Vec<&Record>)> = Vec::new();
    for row in rows {
        let key = by.and_then(|path| field_value(row, path.trim_start_matches('$')));
        match groups.iter_mut().find(|(k, _)| match (k, &key) {
            (Some(a), Some(b)) => a.loosely_equals(b),
            (None, None) => true,
            _ => false,
        }) {
            Some((_, members)) => members.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut row = Record::new();
        let id = match &key {
            Some(value) => to_wire(value).map_err(|e| e.to_string())?,
            None => Json::Null,
        };
        row.insert(OBJECT_ID.into(), id);
        for (name, accumulator) in spec.iter().filter(|(name, _)| name.as_str() != OBJECT_ID) {
            let term = accumulator
                .get("$sum")
                .ok_or_else(|| format!("unsupported accumulator for {name}"))?;
            let total = match term {
                Json::String(path) => members
                    .iter()
                    .filter_map(|m| field_value(m, path.trim_start_matches('$')))
                    .filter_map(|v| v.as_f64())
                    .sum::<f64>(),
                other => other.as_f64().unwrap_or(0.0) * members.len() as f64,
            };
            let total = if total.fract() == 0.0 && total.abs() < 9.0e15 {
                json!(total as i64)
            } else {
                json!(total)
            };
            row.insert(name.clone(), total);
        }
        out.push(row);
    }
    Ok(out)
}

#[async_trait]
impl Transport for MemoryServer {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        Ok(self.handle(&request))
    }
}
