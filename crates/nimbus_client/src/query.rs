//! Query builder and executor.
//!
//! A [`Query`] is built by chaining constraint calls, each consuming the
//! query and returning the extended one. Constraint values are encoded
//! as they are added; the first invalid one is kept and reported when
//! the query runs, before any request is sent.
//!
//! ```ignore
//! let open = client
//!     .query("Ticket")
//!     .equal_to("status", "open")
//!     .ascending("createdAt")
//!     .limit(2)
//!     .find()
//!     .await?;
//! ```

use crate::client::{invalid_response, Client};
use crate::entity::{Entity, Record};
use crate::error::{ClientError, ClientResult};
use crate::transport::{Method, Request};
use nimbus_codec::{
    encode_pointer, from_wire, to_wire, GeoPoint, Json, Value, EARTH_RADIUS_KM, EARTH_RADIUS_MILES,
};
use nimbus_core::keys::{self, OBJECT_ID};
use nimbus_core::CoreError;
use serde_json::{json, Map};
use std::ops::ControlFlow;
use tracing::debug;

/// Top-level key for relation membership.
const RELATED_TO: &str = "$relatedTo";
/// Top-level key for disjunctions.
const OR: &str = "$or";

const AND: &str = "$and";

/// Options for [`Query::full_text`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullTextOptions {
    language: Option<String>,
    case_sensitive: Option<bool>,
    diacritic_sensitive: Option<bool>,
}

impl FullTextOptions {
    /// Default options: server language, case and diacritic insensitive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the language used for stemming and stop words.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Sets case sensitivity.
    pub fn with_case_sensitive(mut self, sensitive: bool) -> Self {
        self.case_sensitive = Some(sensitive);
        self
    }

    /// Sets diacritic sensitivity.
    pub fn with_diacritic_sensitive(mut self, sensitive: bool) -> Self {
        self.diacritic_sensitive = Some(sensitive);
        self
    }

    fn to_search(&self, term: &str) -> Json {
        let mut search = Map::new();
        search.insert("$term".into(), Json::String(term.to_string()));
        if let Some(language) = &self.language {
            search.insert("$language".into(), Json::String(language.clone()));
        }
        if let Some(sensitive) = self.case_sensitive {
            search.insert("$caseSensitive".into(), Json::Bool(sensitive));
        }
        if let Some(sensitive) = self.diacritic_sensitive {
            search.insert("$diacriticSensitive".into(), Json::Bool(sensitive));
        }
        json!({ "$search": search })
    }
}

/// One `(key, comparator, value)` clause. A clause without a comparator
/// is an equality (or a top-level `$or` / `$relatedTo` entry).
#[derive(Debug, Clone, PartialEq)]
struct Constraint {
    key: String,
    comparator: Option<&'static str>,
    value: Json,
}

/// A query over one class.
#[derive(Debug, Clone)]
pub struct Query {
    client: Client,
    class_name: String,
    constraints: Vec<Constraint>,
    order: Vec<String>,
    include: Vec<String>,
    select: Option<Vec<String>>,
    skip: Option<u64>,
    limit: Option<u64>,
    redirect_key: Option<String>,
    /// Clauses ANDed with the constraints without replacing them.
    conjuncts: Vec<(String, Json)>,
    error: Option<CoreError>,
}

impl Query {
    pub(crate) fn new(client: Client, class_name: &str) -> Self {
        let error = keys::validate_class_name(class_name).err();
        Self {
            client,
            class_name: class_name.to_string(),
            constraints: Vec::new(),
            order: Vec::new(),
            include: Vec::new(),
            select: None,
            skip: None,
            limit: None,
            redirect_key: None,
            conjuncts: Vec::new(),
            error,
        }
    }

    /// Class the query runs over.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    fn fail(mut self, error: CoreError) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    fn push(mut self, key: &str, comparator: Option<&'static str>, value: Json) -> Self {
        if key.is_empty() {
            return self.fail(CoreError::validation("query key must not be empty"));
        }
        self.constraints.push(Constraint {
            key: key.to_string(),
            comparator,
            value,
        });
        self
    }

    fn compare(self, key: &str, comparator: &'static str, value: impl Into<Value>) -> Self {
        match to_wire(&value.into()) {
            Ok(json) => self.push(key, Some(comparator), json),
            Err(err) => self.fail(err.into()),
        }
    }

    fn compare_many<I, V>(self, key: &str, comparator: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let encoded: Result<Vec<Json>, _> = values.into_iter().map(|v| to_wire(&v.into())).collect();
        match encoded {
            Ok(items) => self.push(key, Some(comparator), Json::Array(items)),
            Err(err) => self.fail(err.into()),
        }
    }

    /// `key` equals `value`. Replaces other constraints on the key.
    pub fn equal_to(self, key: &str, value: impl Into<Value>) -> Self {
        match to_wire(&value.into()) {
            Ok(json) => self.push(key, None, json),
            Err(err) => self.fail(err.into()),
        }
    }

    /// `key` differs from `value`.
    pub fn not_equal_to(self, key: &str, value: impl Into<Value>) -> Self {
        self.compare(key, "$ne", value)
    }

    /// `key` is less than `value`.
    pub fn less_than(self, key: &str, value: impl Into<Value>) -> Self {
        self.compare(key, "$lt", value)
    }

    /// `key` is at most `value`.
    pub fn less_than_or_equal_to(self, key: &str, value: impl Into<Value>) -> Self {
        self.compare(key, "$lte", value)
    }

    /// `key` is greater than `value`.
    pub fn greater_than(self, key: &str, value: impl Into<Value>) -> Self {
        self.compare(key, "$gt", value)
    }

    /// `key` is at least `value`.
    pub fn greater_than_or_equal_to(self, key: &str, value: impl Into<Value>) -> Self {
        self.compare(key, "$gte", value)
    }

    /// `key` is one of `values`.
    pub fn contained_in<I, V>(self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.compare_many(key, "$in", values)
    }

    /// `key` is none of `values`.
    pub fn not_contained_in<I, V>(self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.compare_many(key, "$nin", values)
    }

    /// Array `key` contains every one of `values`.
    pub fn contains_all<I, V>(self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.compare_many(key, "$all", values)
    }

    /// `key` is present.
    pub fn exists(self, key: &str) -> Self {
        self.push(key, Some("$exists"), Json::Bool(true))
    }

    /// `key` is absent.
    pub fn does_not_exist(self, key: &str) -> Self {
        self.push(key, Some("$exists"), Json::Bool(false))
    }

    /// Text `key` matches a regular expression.
    ///
    /// `modifiers` may contain `i`, `m`, `s` and `x`. The pattern is
    /// checked here so a bad one fails before any request.
    pub fn matches(self, key: &str, pattern: &str, modifiers: &str) -> Self {
        if let Some(bad) = modifiers.chars().find(|c| !"imsx".contains(*c)) {
            return self.fail(CoreError::validation(format!(
                "unsupported regex modifier {bad:?}"
            )));
        }
        let check = if modifiers.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{modifiers}){pattern}")
        };
        if let Err(err) = regex_lite::Regex::new(&check) {
            return self.fail(CoreError::validation(format!("invalid regex: {err}")));
        }
        let query = self.push(key, Some("$regex"), Json::String(pattern.to_string()));
        if modifiers.is_empty() {
            query
        } else {
            query.push(key, Some("$options"), Json::String(modifiers.to_string()))
        }
    }

    /// Text `key` contains `substring`.
    pub fn contains(self, key: &str, substring: &str) -> Self {
        self.matches(key, &regex_lite::escape(substring), "")
    }

    /// Text `key` starts with `prefix`.
    pub fn starts_with(self, key: &str, prefix: &str) -> Self {
        self.matches(key, &format!("^{}", regex_lite::escape(prefix)), "")
    }

    /// Text `key` ends with `suffix`.
    pub fn ends_with(self, key: &str, suffix: &str) -> Self {
        self.matches(key, &format!("{}$", regex_lite::escape(suffix)), "")
    }

    /// Full-text search on `key`. Requires a text index on the server.
    pub fn full_text(self, key: &str, term: &str, options: FullTextOptions) -> Self {
        if term.is_empty() {
            return self.fail(CoreError::validation("full text search term must not be empty"));
        }
        let search = options.to_search(term);
        self.push(key, Some("$text"), search)
    }

    fn subquery(&self, other: &Query) -> Result<Json, CoreError> {
        if let Some(err) = &other.error {
            return Err(err.clone());
        }
        let mut body = Map::new();
        body.insert("where".into(), Json::Object(other.compile_where()));
        body.insert("className".into(), Json::String(other.class_name.clone()));
        Ok(Json::Object(body))
    }

    fn nested(self, key: &str, comparator: &'static str, other: &Query) -> Self {
        match self.subquery(other) {
            Ok(value) => self.push(key, Some(comparator), value),
            Err(err) => self.fail(err),
        }
    }

    fn nested_key(self, key: &str, comparator: &'static str, query_key: &str, other: &Query) -> Self {
        match self.subquery(other) {
            Ok(query) => self.push(key, Some(comparator), json!({ "query": query, "key": query_key })),
            Err(err) => self.fail(err),
        }
    }

    /// Pointer `key` refers to a record matched by `other`.
    pub fn matches_query(self, key: &str, other: &Query) -> Self {
        self.nested(key, "$inQuery", other)
    }

    /// Pointer `key` refers to no record matched by `other`.
    pub fn does_not_match_query(self, key: &str, other: &Query) -> Self {
        self.nested(key, "$notInQuery", other)
    }

    /// `key` equals `query_key` of some record matched by `other`.
    pub fn matches_key_in_query(self, key: &str, query_key: &str, other: &Query) -> Self {
        self.nested_key(key, "$select", query_key, other)
    }

    /// `key` equals `query_key` of no record matched by `other`.
    pub fn does_not_match_key_in_query(self, key: &str, query_key: &str, other: &Query) -> Self {
        self.nested_key(key, "$dontSelect", query_key, other)
    }

    /// Orders by distance from `point`, nearest first.
    pub fn near(self, key: &str, point: GeoPoint) -> Self {
        self.compare(key, "$nearSphere", point)
    }

    /// Points within `max_distance` radians of `point`, nearest first.
    pub fn within_radians(self, key: &str, point: GeoPoint, max_distance: f64) -> Self {
        if !(max_distance.is_finite() && max_distance >= 0.0) {
            return self.fail(CoreError::validation(format!(
                "invalid max distance {max_distance}"
            )));
        }
        self.near(key, point)
            .compare(key, "$maxDistance", Value::Float(max_distance))
    }

    /// Points within `max_distance` kilometers of `point`. With `sorted`
    /// the nearest come first; otherwise the query's own order applies.
    pub fn within_kilometers(
        self,
        key: &str,
        point: GeoPoint,
        max_distance: f64,
        sorted: bool,
    ) -> Self {
        self.within_sphere(key, point, max_distance / EARTH_RADIUS_KM, sorted)
    }

    /// Points within `max_distance` miles of `point`. With `sorted` the
    /// nearest come first; otherwise the query's own order applies.
    pub fn within_miles(
        self,
        key: &str,
        point: GeoPoint,
        max_distance: f64,
        sorted: bool,
    ) -> Self {
        self.within_sphere(key, point, max_distance / EARTH_RADIUS_MILES, sorted)
    }

    fn within_sphere(self, key: &str, point: GeoPoint, radians: f64, sorted: bool) -> Self {
        if sorted {
            return self.within_radians(key, point, radians);
        }
        if !(radians.is_finite() && radians >= 0.0) {
            return self.fail(CoreError::validation(format!("invalid max distance {radians}")));
        }
        let center = json!([point.longitude(), point.latitude()]);
        self.push(key, Some("$geoWithin"), json!({ "$centerSphere": [center, radians] }))
    }

    /// Points inside the box spanned by its south-west and north-east
    /// corners.
    pub fn within_geo_box(self, key: &str, southwest: GeoPoint, northeast: GeoPoint) -> Self {
        if southwest.latitude() > northeast.latitude() {
            return self.fail(CoreError::validation(
                "geo box south-west corner is north of the north-east corner",
            ));
        }
        match (to_wire(&southwest.into()), to_wire(&northeast.into())) {
            (Ok(sw), Ok(ne)) => self.push(key, Some("$within"), json!({ "$box": [sw, ne] })),
            (Err(err), _) | (_, Err(err)) => self.fail(err.into()),
        }
    }

    /// Records held by `owner`'s relation under `key`.
    pub fn related_to(self, owner: &Entity, key: &str) -> Self {
        match owner.to_pointer() {
            Ok(pointer) => {
                self.related_to_json(json!({ "object": encode_pointer(&pointer), "key": key }))
            }
            Err(ClientError::Local(err)) => self.fail(err),
            Err(other) => self.fail(CoreError::validation(other.to_string())),
        }
    }

    pub(crate) fn related_to_json(self, related: Json) -> Self {
        self.push(RELATED_TO, None, related)
    }

    fn and_clause(mut self, key: &str, clause: Json) -> Self {
        self.conjuncts.push((key.to_string(), clause));
        self
    }

    pub(crate) fn redirect_class_name_for_key(mut self, key: &str) -> Self {
        self.redirect_key = Some(key.to_string());
        self
    }

    /// Also matches records matched by any of `queries`.
    ///
    /// All queries must target this query's class. The constraints
    /// added so far become the first branch of the disjunction.
    pub fn or<I>(mut self, queries: I) -> Self
    where
        I: IntoIterator<Item = Query>,
    {
        let mut branches = Vec::new();
        let own = self.compile_where();
        if !own.is_empty() {
            branches.push(Json::Object(own));
        }
        for query in queries {
            if let Some(err) = &query.error {
                return self.fail(err.clone());
            }
            if query.class_name != self.class_name {
                let message = format!(
                    "cannot combine {} and {} queries",
                    self.class_name, query.class_name
                );
                return self.fail(CoreError::validation(message));
            }
            branches.push(Json::Object(query.compile_where()));
        }
        self.constraints.clear();
        self.push(OR, None, Json::Array(branches))
    }

    /// Orders by `key`, ascending, replacing any previous ordering.
    pub fn ascending(mut self, key: &str) -> Self {
        self.order.clear();
        self.add_ascending(key)
    }

    /// Orders by `key`, descending, replacing any previous ordering.
    pub fn descending(mut self, key: &str) -> Self {
        self.order.clear();
        self.add_descending(key)
    }

    /// Adds `key` ascending as a tie-breaker.
    pub fn add_ascending(mut self, key: &str) -> Self {
        self.order.push(key.to_string());
        self
    }

    /// Adds `key` descending as a tie-breaker.
    pub fn add_descending(mut self, key: &str) -> Self {
        self.order.push(format!("-{key}"));
        self
    }

    /// Returns the records pointed to by `key` in full.
    pub fn include(mut self, key: &str) -> Self {
        self.include.push(key.to_string());
        self
    }

    /// Restricts returned attributes to `keys`.
    pub fn select<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select
            .get_or_insert_with(Vec::new)
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Skips the first `n` results.
    pub fn skip(mut self, n: i64) -> Self {
        match u64::try_from(n) {
            Ok(n) => {
                self.skip = Some(n);
                self
            }
            Err(_) => self.fail(CoreError::validation(format!("skip must not be negative: {n}"))),
        }
    }

    /// Returns at most `n` results.
    pub fn limit(mut self, n: i64) -> Self {
        match u64::try_from(n) {
            Ok(n) => {
                self.limit = Some(n);
                self
            }
            Err(_) => self.fail(CoreError::validation(format!("limit must not be negative: {n}"))),
        }
    }

    fn compile_where(&self) -> Map<String, Json> {
        let mut clauses = Map::new();
        for constraint in &self.constraints {
            match constraint.comparator {
                None => {
                    clauses.insert(constraint.key.clone(), constraint.value.clone());
                }
                Some(comparator) => {
                    let entry = clauses
                        .entry(constraint.key.clone())
                        .or_insert_with(|| Json::Object(Map::new()));
                    if !is_operator_object(entry) {
                        *entry = Json::Object(Map::new());
                    }
                    if let Json::Object(ops) = entry {
                        ops.insert(comparator.to_string(), constraint.value.clone());
                    }
                }
            }
        }
        let mut extra = Vec::new();
        for (key, clause) in &self.conjuncts {
            if clauses.contains_key(key) {
                let mut single = Map::new();
                single.insert(key.clone(), clause.clone());
                extra.push(Json::Object(single));
            } else {
                clauses.insert(key.clone(), clause.clone());
            }
        }
        if !extra.is_empty() {
            if let Json::Array(items) = clauses
                .entry(AND)
                .or_insert_with(|| Json::Array(Vec::new()))
            {
                items.extend(extra);
            }
        }
        clauses
    }

    fn check(&self) -> ClientResult<()> {
        match &self.error {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    /// Compiles the request payload.
    ///
    /// # Errors
    ///
    /// Returns the first invalid constraint recorded while building.
    pub fn to_json(&self) -> ClientResult<Json> {
        self.check()?;
        let mut body = Map::new();
        body.insert("where".into(), Json::Object(self.compile_where()));
        if !self.order.is_empty() {
            body.insert("order".into(), Json::String(self.order.join(",")));
        }
        if let Some(keys) = &self.select {
            body.insert("keys".into(), Json::String(keys.join(",")));
        }
        if !self.include.is_empty() {
            body.insert("include".into(), Json::String(self.include.join(",")));
        }
        if let Some(limit) = self.limit {
            body.insert("limit".into(), json!(limit));
        }
        if let Some(skip) = self.skip {
            body.insert("skip".into(), json!(skip));
        }
        if let Some(key) = &self.redirect_key {
            body.insert("redirectClassNameForKey".into(), Json::String(key.clone()));
        }
        Ok(Json::Object(body))
    }

    fn path(&self) -> String {
        format!("/classes/{}", self.class_name)
    }

    /// Runs the query.
    pub async fn find(&self) -> ClientResult<Vec<Entity>> {
        let body = self.to_json()?;
        let response = self
            .client
            .send(Request::new(Method::Get, self.path()).with_json(body))
            .await?;
        let class_name = response
            .get(keys::CLASS_NAME)
            .and_then(Json::as_str)
            .unwrap_or(self.class_name.as_str())
            .to_string();
        let records = results(&response)?
            .iter()
            .map(|item| Record::decode(item).map_err(invalid_response))
            .collect::<ClientResult<Vec<_>>>()?;
        debug!(class = %class_name, results = records.len(), "query executed");
        records
            .into_iter()
            .map(|record| Entity::materialize(&self.client, &class_name, record))
            .collect()
    }

    /// Runs the query for at most one result.
    pub async fn first(&self) -> ClientResult<Option<Entity>> {
        let mut found = self.clone().limit(1).find().await?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    /// Counts matching records. Ordering, projection, includes and
    /// skip are ignored.
    pub async fn count(&self) -> ClientResult<u64> {
        self.check()?;
        let body = json!({
            "where": self.compile_where(),
            "limit": 0,
            "count": 1,
        });
        let response = self
            .client
            .send(Request::new(Method::Get, self.path()).with_json(body))
            .await?;
        response
            .get("count")
            .and_then(Json::as_u64)
            .ok_or_else(|| invalid_response("missing count"))
    }

    /// The matching record with object id `id`.
    pub async fn get(&self, id: &str) -> ClientResult<Entity> {
        self.clone()
            .and_clause(OBJECT_ID, Json::String(id.to_string()))
            .first()
            .await?
            .ok_or_else(|| ClientError::NotFound {
                class_name: self.class_name.clone(),
                id: id.to_string(),
            })
    }

    /// Visits every matching record in object id order, one page at a
    /// time, and returns the number of records visited.
    ///
    /// Pages are requested one after another with a cursor on the last
    /// object id seen, so records added during the walk are still
    /// visited once if they sort after the cursor. The callback stops
    /// the walk by returning `ControlFlow::Break`.
    ///
    /// # Errors
    ///
    /// A query with an ordering or a skip is rejected locally.
    pub async fn each<F>(&self, mut callback: F) -> ClientResult<u64>
    where
        F: FnMut(Entity) -> ControlFlow<()>,
    {
        self.check()?;
        if !self.order.is_empty() || self.skip.is_some() {
            return Err(ClientError::validation(
                "each() walks in object id order and cannot be combined with order or skip",
            ));
        }
        let page_size = self
            .limit
            .unwrap_or_else(|| u64::from(self.client.config().batch_size))
            .max(1);
        let page_limit = i64::try_from(page_size).unwrap_or(i64::MAX);

        let mut cursor: Option<String> = None;
        let mut visited = 0u64;
        let mut pages = 0u64;
        loop {
            let mut page = self.clone();
            page.limit = None;
            page = page.ascending(OBJECT_ID).limit(page_limit);
            if let Some(last) = &cursor {
                page = page.and_clause(OBJECT_ID, json!({ "$gt": last }));
            }
            let results = page.find().await?;
            pages += 1;
            let full = results.len() as u64 >= page_size;
            for entity in results {
                cursor = entity.id();
                visited += 1;
                if callback(entity).is_break() {
                    debug!(class = %self.class_name, visited, pages, "each stopped early");
                    return Ok(visited);
                }
            }
            if !full || cursor.is_none() {
                break;
            }
        }
        debug!(class = %self.class_name, visited, pages, "each finished");
        Ok(visited)
    }

    /// Distinct values of `key` among matching records.
    pub async fn distinct(&self, key: &str) -> ClientResult<Vec<Value>> {
        self.check()?;
        let body = json!({ "distinct": key, "where": self.compile_where() });
        let response = self
            .client
            .send(Request::new(Method::Get, format!("/aggregate/{}", self.class_name)).with_json(body))
            .await?;
        results(&response)?
            .iter()
            .map(|item| from_wire(item).map_err(invalid_response))
            .collect()
    }

    /// Runs an aggregation pipeline and returns the raw results.
    pub async fn aggregate(&self, pipeline: Json) -> ClientResult<Vec<Json>> {
        if !(pipeline.is_array() || pipeline.is_object()) {
            return Err(ClientError::validation(
                "aggregation pipeline must be an array or an object",
            ));
        }
        let body = json!({ "pipeline": pipeline });
        let response = self
            .client
            .send(Request::new(Method::Get, format!("/aggregate/{}", self.class_name)).with_json(body))
            .await?;
        Ok(results(&response)?.clone())
    }
}

fn results(response: &Json) -> ClientResult<&Vec<Json>> {
    response
        .get("results")
        .and_then(Json::as_array)
        .ok_or_else(|| invalid_response("missing results"))
}

fn is_operator_object(value: &Json) -> bool {
    match value {
        Json::Object(map) => map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}
