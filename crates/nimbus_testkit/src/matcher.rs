//! `where` clause evaluation for the in-memory server.

use crate::server::{Record, State};
use nimbus_codec::{from_wire, parse_iso, GeoPoint, Json, Value};
use nimbus_core::keys::{CREATED_AT, OBJECT_ID, UPDATED_AT};
use serde_json::Map;
use std::cmp::Ordering;

type MatchResult<T> = Result<T, String>;

/// Reads a possibly dotted field path from a stored record.
///
/// `createdAt` and `updatedAt` are stored as plain ISO strings and come
/// back as dates.
pub(crate) fn field_value(record: &Record, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut json = record.get(first)?;
    for part in parts {
        json = json.get(part)?;
    }
    if !path.contains('.') && (first == CREATED_AT || first == UPDATED_AT) {
        if let Some(date) = json.as_str().and_then(|s| parse_iso(s).ok()) {
            return Some(Value::Date(date));
        }
    }
    from_wire(json).ok()
}

fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match (field, expected) {
        (None | Some(Value::Null), Value::Null) => true,
        (None, _) => false,
        (Some(Value::Array(items)), expected) if !matches!(expected, Value::Array(_)) => {
            items.iter().any(|item| item.loosely_equals(expected))
        }
        (Some(value), expected) => value.loosely_equals(expected),
    }
}

fn compare(field: Option<&Value>, expected: &Value, accept: fn(Ordering) -> bool) -> bool {
    field
        .and_then(|value| value.compare(expected))
        .is_some_and(accept)
}

fn decode(json: &Json) -> MatchResult<Value> {
    from_wire(json).map_err(|e| e.to_string())
}

fn decode_list(json: &Json, operator: &str) -> MatchResult<Vec<Value>> {
    json.as_array()
        .ok_or_else(|| format!("{operator} requires an array"))?
        .iter()
        .map(decode)
        .collect()
}

fn geo_point(json: &Json, operator: &str) -> MatchResult<GeoPoint> {
    decode(json)?
        .as_geo_point()
        .ok_or_else(|| format!("{operator} requires a GeoPoint"))
}

/// Returns true for `{"$op": ...}` maps, as opposed to literal objects.
fn is_operator_object(map: &Map<String, Json>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn regex_matches(field: Option<&Value>, pattern: &str, options: &str) -> MatchResult<bool> {
    let flags: String = options.chars().filter(|c| "imsx".contains(*c)).collect();
    let source = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    let regex = regex_lite::Regex::new(&source).map_err(|e| e.to_string())?;
    Ok(field
        .and_then(Value::as_text)
        .is_some_and(|text| regex.is_match(text)))
}

fn text_matches(field: Option<&Value>, search: &Json) -> MatchResult<bool> {
    let search = search
        .get("$search")
        .ok_or("$text requires $search")?;
    let term = search
        .get("$term")
        .and_then(Json::as_str)
        .ok_or("$text requires a $term")?;
    let case_sensitive = search
        .get("$caseSensitive")
        .and_then(Json::as_bool)
        .unwrap_or(false);
    let Some(text) = field.and_then(Value::as_text) else {
        return Ok(false);
    };
    let fold = |s: &str| {
        if case_sensitive {
            s.to_string()
        } else {
            s.to_lowercase()
        }
    };
    let haystack = fold(text);
    let words: Vec<String> = haystack
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_string)
        .collect();
    Ok(term
        .split_whitespace()
        .all(|needle| words.iter().any(|w| *w == fold(needle))))
}

/// Evaluates `where` clauses against the records of a [`State`].
pub(crate) struct Matcher<'a> {
    state: &'a State,
}

impl<'a> Matcher<'a> {
    pub(crate) fn new(state: &'a State) -> Self {
        Self { state }
    }

    /// Records of `class_name` matching `clauses`, in id order.
    pub(crate) fn filter(
        &self,
        class_name: &str,
        clauses: &Map<String, Json>,
    ) -> MatchResult<Vec<&'a Record>> {
        let mut matched = Vec::new();
        for record in self.state.records(class_name) {
            if self.matches(class_name, record, clauses)? {
                matched.push(record);
            }
        }
        Ok(matched)
    }

    pub(crate) fn matches(
        &self,
        class_name: &str,
        record: &Record,
        clauses: &Map<String, Json>,
    ) -> MatchResult<bool> {
        for (key, condition) in clauses {
            let matched = match key.as_str() {
                "$or" => self.any_branch(class_name, record, condition)?,
                "$and" => self.all_branches(class_name, record, condition)?,
                "$relatedTo" => self.related(record, condition)?,
                _ => self.field_matches(record, key, condition)?,
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn branches<'j>(condition: &'j Json, operator: &str) -> MatchResult<Vec<&'j Map<String, Json>>> {
        condition
            .as_array()
            .ok_or_else(|| format!("{operator} requires an array"))?
            .iter()
            .map(|branch| {
                branch
                    .as_object()
                    .ok_or_else(|| format!("{operator} branches must be objects"))
            })
            .collect()
    }

    fn any_branch(&self, class_name: &str, record: &Record, condition: &Json) -> MatchResult<bool> {
        for branch in Self::branches(condition, "$or")? {
            if self.matches(class_name, record, branch)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn all_branches(&self, class_name: &str, record: &Record, condition: &Json) -> MatchResult<bool> {
        for branch in Self::branches(condition, "$and")? {
            if !self.matches(class_name, record, branch)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn related(&self, record: &Record, condition: &Json) -> MatchResult<bool> {
        let owner = condition
            .get("object")
            .map(decode)
            .transpose()?
            .and_then(|v| v.as_pointer().cloned())
            .ok_or("$relatedTo requires an object pointer")?;
        let key = condition
            .get("key")
            .and_then(Json::as_str)
            .ok_or("$relatedTo requires a key")?;
        let id = record.get(OBJECT_ID).and_then(Json::as_str).unwrap_or_default();
        Ok(self
            .state
            .related(&owner.class_name, &owner.object_id, key)
            .is_some_and(|members| members.contains(id)))
    }

    /// Values of `key` in the records matched by a `{where, className}`
    /// subquery.
    fn subquery(&self, query: &Json, key: &str) -> MatchResult<Vec<Value>> {
        let class_name = query
            .get("className")
            .and_then(Json::as_str)
            .ok_or("subquery requires a className")?;
        let clauses = query
            .get("where")
            .and_then(Json::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(self
            .filter(class_name, &clauses)?
            .into_iter()
            .filter_map(|record| {
                if key == OBJECT_ID {
                    let id = record.get(OBJECT_ID).and_then(Json::as_str)?;
                    Some(Value::Pointer(nimbus_codec::Pointer::new(class_name, id)))
                } else {
                    field_value(record, key)
                }
            })
            .collect())
    }

    fn field_matches(&self, record: &Record, key: &str, condition: &Json) -> MatchResult<bool> {
        let field = field_value(record, key);
        let field = field.as_ref();
        let operators = match condition {
            Json::Object(map) if is_operator_object(map) => map,
            literal => return Ok(equals(field, &decode(literal)?)),
        };

        for (operator, argument) in operators {
            let matched = match operator.as_str() {
                "$ne" => !equals(field, &decode(argument)?),
                "$lt" => compare(field, &decode(argument)?, Ordering::is_lt),
                "$lte" => compare(field, &decode(argument)?, Ordering::is_le),
                "$gt" => compare(field, &decode(argument)?, Ordering::is_gt),
                "$gte" => compare(field, &decode(argument)?, Ordering::is_ge),
                "$in" => decode_list(argument, operator)?
                    .iter()
                    .any(|candidate| equals(field, candidate)),
                "$nin" => !decode_list(argument, operator)?
                    .iter()
                    .any(|candidate| equals(field, candidate)),
                "$all" => {
                    let wanted = decode_list(argument, operator)?;
                    match field {
                        Some(Value::Array(items)) => wanted
                            .iter()
                            .all(|w| items.iter().any(|item| item.loosely_equals(w))),
                        _ => false,
                    }
                }
                "$exists" => {
                    let present = field.is_some_and(|v| !v.is_null());
                    present == argument.as_bool().unwrap_or(true)
                }
                "$regex" => {
                    let pattern = argument.as_str().ok_or("$regex requires a string")?;
                    let options = operators
                        .get("$options")
                        .and_then(Json::as_str)
                        .unwrap_or_default();
                    regex_matches(field, pattern, options)?
                }
                "$text" => text_matches(field, argument)?,
                "$inQuery" | "$notInQuery" => {
                    let pointers = self.subquery(argument, OBJECT_ID)?;
                    let found = pointers.iter().any(|p| equals(field, p));
                    found == (operator == "$inQuery")
                }
                "$select" | "$dontSelect" => {
                    let query = argument.get("query").ok_or("$select requires a query")?;
                    let query_key = argument
                        .get("key")
                        .and_then(Json::as_str)
                        .ok_or("$select requires a key")?;
                    let values = self.subquery(query, query_key)?;
                    let found = values.iter().any(|v| equals(field, v));
                    found == (operator == "$select")
                }
                "$nearSphere" => {
                    let origin = geo_point(argument, operator)?;
                    match field.and_then(Value::as_geo_point) {
                        Some(point) => match operators.get("$maxDistance") {
                            Some(max) => {
                                let max = max.as_f64().ok_or("$maxDistance must be a number")?;
                                point.radians_to(&origin) <= max
                            }
                            None => true,
                        },
                        None => false,
                    }
                }
                "$within" => {
                    let corners = argument
                        .get("$box")
                        .and_then(Json::as_array)
                        .filter(|corners| corners.len() == 2)
                        .ok_or("$within requires a $box of two points")?;
                    let southwest = geo_point(&corners[0], "$box")?;
                    let northeast = geo_point(&corners[1], "$box")?;
                    field.and_then(Value::as_geo_point).is_some_and(|p| {
                        (southwest.latitude()..=northeast.latitude()).contains(&p.latitude())
                            && (southwest.longitude()..=northeast.longitude())
                                .contains(&p.longitude())
                    })
                }
                "$geoWithin" => {
                    let sphere = argument
                        .get("$centerSphere")
                        .and_then(Json::as_array)
                        .filter(|sphere| sphere.len() == 2)
                        .ok_or("$geoWithin requires a $centerSphere")?;
                    let center = sphere[0]
                        .as_array()
                        .filter(|c| c.len() == 2)
                        .and_then(|c| Some((c[0].as_f64()?, c[1].as_f64()?)))
                        .ok_or("$centerSphere center must be [longitude, latitude]")?;
                    let center = GeoPoint::new(center.1, center.0).map_err(|e| e.to_string())?;
                    let radius = sphere[1].as_f64().ok_or("$centerSphere radius must be a number")?;
                    field
                        .and_then(Value::as_geo_point)
                        .is_some_and(|p| p.radians_to(&center) <= radius)
                }
                "$options" | "$maxDistance" => true,
                other => return Err(format!("unknown operator {other}")),
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// The `$nearSphere` origin of the clauses, if any.
fn near_origin(clauses: &Map<String, Json>) -> Option<(String, GeoPoint)> {
    clauses.iter().find_map(|(key, condition)| {
        let origin = condition.get("$nearSphere")?;
        let point = from_wire(origin).ok()?.as_geo_point()?;
        Some((key.clone(), point))
    })
}

/// Sorts records by `order` keys (`-` prefix for descending).
///
/// Missing values sort first. Without an order, a `$nearSphere` clause
/// sorts by distance. The sort is stable, so ties keep id order.
pub(crate) fn sort_records(records: &mut [&Record], order: &[String], clauses: &Map<String, Json>) {
    if order.is_empty() {
        if let Some((key, origin)) = near_origin(clauses) {
            records.sort_by(|a, b| {
                let distance = |record: &Record| {
                    field_value(record, &key)
                        .and_then(|v| v.as_geo_point())
                        .map(|p| p.radians_to(&origin))
                };
                match (distance(a), distance(b)) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            });
        }
        return;
    }
    records.sort_by(|a, b| {
        for key in order {
            let (path, descending) = match key.strip_prefix('-') {
                Some(path) => (path, true),
                None => (key.as_str(), false),
            };
            let ordering = match (field_value(a, path), field_value(b, path)) {
                (Some(x), Some(y)) => x.compare(&y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> State {
        let mut state = State::default();
        let records = [
            json!({ "objectId": "a", "name": "Ann", "score": 10, "tags": ["x", "y"],
                    "bio": "Likes strong coffee", "createdAt": "2024-01-01T00:00:01.000Z",
                    "home": { "__type": "GeoPoint", "latitude": 0.0, "longitude": 0.0 } }),
            json!({ "objectId": "b", "name": "bob", "score": 2.5, "tags": ["y"],
                    "createdAt": "2024-01-01T00:00:02.000Z",
                    "home": { "__type": "GeoPoint", "latitude": 10.0, "longitude": 10.0 } }),
            json!({ "objectId": "c", "name": "Cy", "createdAt": "2024-01-01T00:00:03.000Z",
                    "team": { "__type": "Pointer", "className": "Team", "objectId": "t1" } }),
        ];
        for record in records {
            let record = record.as_object().unwrap().clone();
            let id = record[OBJECT_ID].as_str().unwrap().to_string();
            state.classes.entry("Player".into()).or_default().insert(id, record);
        }
        let team = json!({ "objectId": "t1", "name": "red" });
        state
            .classes
            .entry("Team".into())
            .or_default()
            .insert("t1".into(), team.as_object().unwrap().clone());
        state
    }

    fn ids(state: &State, clauses: Json) -> Vec<String> {
        Matcher::new(state)
            .filter("Player", clauses.as_object().unwrap())
            .unwrap()
            .into_iter()
            .map(|r| r[OBJECT_ID].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn comparisons_and_sets() {
        let state = state();
        assert_eq!(ids(&state, json!({ "score": { "$gt": 2, "$lt": 10 } })), ["b"]);
        assert_eq!(ids(&state, json!({ "score": { "$gte": 10.0 } })), ["a"]);
        assert_eq!(ids(&state, json!({ "tags": "y" })), ["a", "b"]);
        assert_eq!(ids(&state, json!({ "tags": { "$all": ["x", "y"] } })), ["a"]);
        assert_eq!(ids(&state, json!({ "name": { "$in": ["bob", "Cy"] } })), ["b", "c"]);
        assert_eq!(ids(&state, json!({ "name": { "$nin": ["bob"] } })), ["a", "c"]);
        assert_eq!(ids(&state, json!({ "score": { "$exists": false } })), ["c"]);
        assert_eq!(ids(&state, json!({ "name": { "$ne": "Ann" } })), ["b", "c"]);
    }

    #[test]
    fn dates_compare_chronologically() {
        let state = state();
        let after = json!({ "createdAt": { "$gt": { "__type": "Date", "iso": "2024-01-01T00:00:01.500Z" } } });
        assert_eq!(ids(&state, after), ["b", "c"]);
    }

    #[test]
    fn text_and_regex() {
        let state = state();
        assert_eq!(ids(&state, json!({ "name": { "$regex": "^b" } })), ["b"]);
        assert_eq!(ids(&state, json!({ "name": { "$regex": "^a", "$options": "i" } })), ["a"]);
        let search = json!({ "bio": { "$text": { "$search": { "$term": "COFFEE" } } } });
        assert_eq!(ids(&state, search), ["a"]);
    }

    #[test]
    fn disjunction_and_subqueries() {
        let state = state();
        let either = json!({ "$or": [{ "name": "Ann" }, { "score": 2.5 }] });
        assert_eq!(ids(&state, either), ["a", "b"]);
        let in_team = json!({ "team": { "$inQuery": { "className": "Team", "where": { "name": "red" } } } });
        assert_eq!(ids(&state, in_team), ["c"]);
        let select = json!({ "name": { "$select": {
            "query": { "className": "Team", "where": {} }, "key": "name" } } });
        assert!(ids(&state, select).is_empty());
    }

    #[test]
    fn geo_filters() {
        let state = state();
        let origin = json!({ "__type": "GeoPoint", "latitude": 9.0, "longitude": 9.0 });
        let near = json!({ "home": { "$nearSphere": origin.clone(), "$maxDistance": 0.1 } });
        assert_eq!(ids(&state, near), ["b"]);
        let boxed = json!({ "home": { "$within": { "$box": [
            { "__type": "GeoPoint", "latitude": -1.0, "longitude": -1.0 },
            { "__type": "GeoPoint", "latitude": 1.0, "longitude": 1.0 },
        ] } } });
        assert_eq!(ids(&state, boxed), ["a"]);
        let sphere = json!({ "home": { "$geoWithin": { "$centerSphere": [[9.0, 9.0], 0.1] } } });
        assert_eq!(ids(&state, sphere), ["b"]);

        let clauses = json!({ "home": { "$nearSphere": origin } });
        let clauses = clauses.as_object().unwrap();
        let mut records = Matcher::new(&state).filter("Player", clauses).unwrap();
        sort_records(&mut records, &[], clauses);
        assert_eq!(records[0][OBJECT_ID], "b");
    }

    #[test]
    fn sorting_puts_missing_first() {
        let state = state();
        let mut records: Vec<&Record> = state.records("Player").collect();
        sort_records(&mut records, &["-score".to_string()], &Map::new());
        let order: Vec<_> = records.iter().map(|r| r[OBJECT_ID].clone()).collect();
        assert_eq!(order, [json!("a"), json!("b"), json!("c")]);
        sort_records(&mut records, &["score".to_string()], &Map::new());
        assert_eq!(records[0][OBJECT_ID], "c");
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let state = state();
        let clauses = json!({ "score": { "$near": 1 } });
        assert!(Matcher::new(&state)
            .filter("Player", clauses.as_object().unwrap())
            .is_err());
    }
}
