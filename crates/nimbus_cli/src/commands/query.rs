//! Query commands.

use super::output::{self, Format};
use super::{CliError, CliResult};
use nimbus_client::{Client, Json, Query, Value};
use nimbus_codec::from_wire;
use serde_json::Map;
use std::ops::ControlFlow;
use tracing::info;

/// Query arguments shared by the query commands.
#[derive(Debug, Default)]
pub struct QueryOptions {
    /// JSON `where` object.
    pub r#where: Option<String>,
    /// Comma separated sort keys.
    pub order: Option<String>,
    /// Maximum number of records.
    pub limit: Option<i64>,
    /// Records to skip.
    pub skip: Option<i64>,
    /// Comma separated keys to return.
    pub keys: Option<String>,
    /// Comma separated pointer keys to include.
    pub include: Option<String>,
}

fn split(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Builds a query from command-line arguments.
pub fn build(client: &Client, class_name: &str, options: &QueryOptions) -> CliResult<Query> {
    let mut query = filtered(client, class_name, options.r#where.as_deref())?;
    if let Some(order) = &options.order {
        for key in split(order) {
            query = match key.strip_prefix('-') {
                Some(key) => query.add_descending(key),
                None => query.add_ascending(key),
            };
        }
    }
    if let Some(keys) = &options.keys {
        query = query.select(split(keys));
    }
    if let Some(include) = &options.include {
        for key in split(include) {
            query = query.include(key);
        }
    }
    if let Some(limit) = options.limit {
        query = query.limit(limit);
    }
    if let Some(skip) = options.skip {
        query = query.skip(skip);
    }
    // Surface builder errors before anything is sent
    query.to_json()?;
    Ok(query)
}

/// A query over `class_name` restricted by an optional JSON `where`.
pub fn filtered(client: &Client, class_name: &str, clauses: Option<&str>) -> CliResult<Query> {
    let query = client.query(class_name);
    let Some(clauses) = clauses else {
        return Ok(query);
    };
    let parsed: Json =
        serde_json::from_str(clauses).map_err(|e| CliError::InvalidWhere(e.to_string()))?;
    let Json::Object(clauses) = parsed else {
        return Err(CliError::InvalidWhere("expected a JSON object".into()));
    };
    apply(client, class_name, query, &clauses)
}

fn decode(json: &Json) -> CliResult<Value> {
    from_wire(json).map_err(|e| CliError::InvalidWhere(e.to_string()))
}

fn decode_list(json: &Json) -> CliResult<Vec<Value>> {
    json.as_array()
        .ok_or_else(|| CliError::InvalidWhere(format!("expected an array, got {json}")))?
        .iter()
        .map(decode)
        .collect()
}

fn apply(
    client: &Client,
    class_name: &str,
    mut query: Query,
    clauses: &Map<String, Json>,
) -> CliResult<Query> {
    for (key, condition) in clauses {
        if key == "$or" {
            let branches = condition
                .as_array()
                .ok_or_else(|| CliError::InvalidWhere("$or expects an array".into()))?
                .iter()
                .map(|branch| match branch {
                    Json::Object(branch) => apply(client, class_name, client.query(class_name), branch),
                    _ => Err(CliError::InvalidWhere("$or branches must be objects".into())),
                })
                .collect::<CliResult<Vec<_>>>()?;
            query = query.or(branches);
            continue;
        }
        let operators = match condition {
            Json::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
            literal => {
                query = query.equal_to(key, decode(literal)?);
                continue;
            }
        };
        for (operator, argument) in operators {
            query = match operator.as_str() {
                "$ne" => query.not_equal_to(key, decode(argument)?),
                "$lt" => query.less_than(key, decode(argument)?),
                "$lte" => query.less_than_or_equal_to(key, decode(argument)?),
                "$gt" => query.greater_than(key, decode(argument)?),
                "$gte" => query.greater_than_or_equal_to(key, decode(argument)?),
                "$in" => query.contained_in(key, decode_list(argument)?),
                "$nin" => query.not_contained_in(key, decode_list(argument)?),
                "$all" => query.contains_all(key, decode_list(argument)?),
                "$exists" => match argument.as_bool() {
                    Some(true) => query.exists(key),
                    Some(false) => query.does_not_exist(key),
                    None => return Err(CliError::InvalidWhere("$exists expects a boolean".into())),
                },
                "$regex" => {
                    let pattern = argument
                        .as_str()
                        .ok_or_else(|| CliError::InvalidWhere("$regex expects a string".into()))?;
                    let options = operators
                        .get("$options")
                        .and_then(Json::as_str)
                        .unwrap_or_default();
                    query.matches(key, pattern, options)
                }
                "$options" => query,
                other => return Err(CliError::UnsupportedOperator(other.to_string())),
            };
        }
    }
    Ok(query)
}

/// Runs a query and prints one page of results.
pub async fn run(query: &Query, format: Format) -> CliResult<()> {
    let results = query.find().await?;
    for entity in &results {
        println!("{}", output::entity(entity, format)?);
    }
    info!(class = %query.class_name(), count = results.len(), "query complete");
    Ok(())
}

/// Walks every matching record and prints it.
pub async fn walk(query: &Query, format: Format) -> CliResult<()> {
    let mut failure = None;
    let visited = query
        .each(|entity| match output::entity(&entity, format) {
            Ok(line) => {
                println!("{line}");
                ControlFlow::Continue(())
            }
            Err(err) => {
                failure = Some(err);
                ControlFlow::Break(())
            }
        })
        .await?;
    if let Some(err) = failure {
        return Err(err);
    }
    info!(class = %query.class_name(), count = visited, "walk complete");
    Ok(())
}

/// Prints the distinct values of `key`.
pub async fn distinct(query: &Query, key: &str) -> CliResult<()> {
    for value in query.distinct(key).await? {
        println!("{}", output::value(&value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_client::{ClientConfig, MockTransport};
    use serde_json::json;

    fn client() -> Client {
        Client::new(ClientConfig::new("app", "http://localhost"), MockTransport::new())
    }

    #[test]
    fn translates_where_into_builder_calls() {
        let client = client();
        let clauses = r#"{"status":"open","n":{"$gte":2,"$lt":9},"tag":{"$in":["a","b"]},"gone":{"$exists":false}}"#;
        let query = filtered(&client, "Ticket", Some(clauses)).unwrap();
        assert_eq!(
            query.to_json().unwrap()["where"],
            json!({
                "status": "open",
                "n": { "$gte": 2, "$lt": 9 },
                "tag": { "$in": ["a", "b"] },
                "gone": { "$exists": false },
            })
        );
    }

    #[test]
    fn builds_order_keys_and_paging() {
        let client = client();
        let options = QueryOptions {
            order: Some("-openedAt, status".into()),
            keys: Some("status".into()),
            include: Some("owner".into()),
            limit: Some(5),
            skip: Some(10),
            ..QueryOptions::default()
        };
        let body = build(&client, "Ticket", &options).unwrap().to_json().unwrap();
        assert_eq!(body["order"], "-openedAt,status");
        assert_eq!(body["keys"], "status");
        assert_eq!(body["include"], "owner");
        assert_eq!(body["limit"], 5);
        assert_eq!(body["skip"], 10);
    }

    #[test]
    fn disjunctions_and_regex() {
        let client = client();
        let clauses = r#"{"$or":[{"status":"open"},{"title":{"$regex":"^bug","$options":"i"}}]}"#;
        let query = filtered(&client, "Ticket", Some(clauses)).unwrap();
        assert_eq!(
            query.to_json().unwrap()["where"],
            json!({ "$or": [
                { "status": "open" },
                { "title": { "$regex": "^bug", "$options": "i" } },
            ] })
        );
    }

    #[test]
    fn rejects_bad_where() {
        let client = client();
        assert!(matches!(
            filtered(&client, "Ticket", Some("[1]")),
            Err(CliError::InvalidWhere(_))
        ));
        assert!(matches!(
            filtered(&client, "Ticket", Some(r#"{"loc":{"$nearSphere":1}}"#)),
            Err(CliError::UnsupportedOperator(op)) if op == "$nearSphere"
        ));
        let negative = QueryOptions {
            limit: Some(-1),
            ..QueryOptions::default()
        };
        assert!(build(&client, "Ticket", &negative).is_err());
    }
}
