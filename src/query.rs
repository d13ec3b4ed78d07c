//! MongoDB-style queries over RunStart documents.
//!
//! Queries are accepted in the forms users type on the command line:
//!
//! ```text
//! {}
//! {'plan_name': 'count'}
//! {"scan_id": {"$gte": 100, "$lt": 200}}
//! TimeRange(since='2020', until='2020-03-01')
//! ```
//!
//! The same query value is evaluated in memory for file-backed catalogs and
//! handed to the server for MongoDB-backed ones.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;

const OPERATORS: &[&str] = &[
    "$and", "$or", "$nor", "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists",
];

/// Errors produced while parsing a query
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Could not parse query {0}.")]
    Parse(String),

    #[error("Unsupported query operator '{0}'")]
    UnsupportedOperator(String),

    #[error("Could not parse time '{0}' in TimeRange")]
    Time(String),

    #[error("TimeRange does not accept '{0}'. Only since and until are supported, and times are read as UTC.")]
    TimeRangeArgument(String),
}

/// A parsed query (always a JSON object)
#[derive(Debug, Clone, PartialEq)]
pub struct Query(Value);

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl Query {
    /// The empty query, which matches every Run
    pub fn all() -> Self {
        Self(json!({}))
    }

    /// Parse a query typed by a user.
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        let trimmed = text.trim();

        if let Some(args) = trimmed
            .strip_prefix("TimeRange(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return Self::parse_time_range(args).map_err(|e| match e {
                QueryError::Time(_) | QueryError::TimeRangeArgument(_) => e,
                _ => QueryError::Parse(text.to_string()),
            });
        }

        // A YAML flow mapping accepts both JSON and Python dict literals.
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(trimmed).map_err(|_| QueryError::Parse(text.to_string()))?;
        let value: Value =
            serde_json::to_value(yaml).map_err(|_| QueryError::Parse(text.to_string()))?;
        if !value.is_object() {
            return Err(QueryError::Parse(text.to_string()));
        }

        Self::from_value(value)
    }

    /// Wrap an already-structured query, checking its operators.
    pub fn from_value(value: Value) -> Result<Self, QueryError> {
        validate_operators(&value)?;
        Ok(Self(value))
    }

    /// `{"time": {"$gte": since, "$lt": until}}` with either bound optional.
    pub fn time_range(since: Option<&str>, until: Option<&str>) -> Result<Self, QueryError> {
        let mut bounds = Map::new();
        if let Some(since) = since {
            bounds.insert("$gte".to_string(), json!(parse_time(since)?));
        }
        if let Some(until) = until {
            bounds.insert("$lt".to_string(), json!(parse_time(until)?));
        }
        if bounds.is_empty() {
            return Ok(Self::all());
        }
        Ok(Self(json!({ "time": bounds })))
    }

    /// Combine queries with `$and`.
    pub fn and(queries: Vec<Query>) -> Self {
        Self(json!({ "$and": queries.into_iter().map(|q| q.0).collect::<Vec<_>>() }))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Evaluate against a RunStart document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self.0.as_object() {
            Some(filter) => matches_object(filter, doc),
            None => false,
        }
    }

    fn parse_time_range(args: &str) -> Result<Self, QueryError> {
        let mut since = None;
        let mut until = None;

        for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| QueryError::Parse(arg.to_string()))?;
            let value = unquote(value.trim()).ok_or_else(|| QueryError::Parse(arg.to_string()))?;
            match key.trim() {
                "since" => since = Some(value),
                "until" => until = Some(value),
                other => return Err(QueryError::TimeRangeArgument(other.to_string())),
            }
        }

        Self::time_range(since, until)
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn unquote(s: &str) -> Option<&str> {
    ['\'', '"']
        .iter()
        .find_map(|q| s.strip_prefix(*q).and_then(|rest| rest.strip_suffix(*q)))
}

/// Parse a date or datetime into Unix seconds. Naive times are UTC.
fn parse_time(text: &str) -> Result<f64, QueryError> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp() as f64);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp() as f64);
        }
    }

    let date = if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        Some(date)
    } else if let Some((year, month)) = text.split_once('-') {
        match (year.parse::<i32>(), month.parse::<u32>()) {
            (Ok(y), Ok(m)) => NaiveDate::from_ymd_opt(y, m, 1),
            _ => None,
        }
    } else {
        text.parse::<i32>()
            .ok()
            .and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1))
    };

    date.and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp() as f64)
        .ok_or_else(|| QueryError::Time(text.to_string()))
}

fn validate_operators(value: &Value) -> Result<(), QueryError> {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                if key.starts_with('$') && !OPERATORS.contains(&key.as_str()) {
                    return Err(QueryError::UnsupportedOperator(key.clone()));
                }
                validate_operators(inner)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_operators),
        _ => Ok(()),
    }
}

fn matches_object(filter: &Map<String, Value>, doc: &Value) -> bool {
    filter.iter().all(|(key, cond)| match key.as_str() {
        "$and" => sub_queries(cond).map(|mut qs| qs.all(|q| matches_object(q, doc))).unwrap_or(false),
        "$or" => sub_queries(cond).map(|mut qs| qs.any(|q| matches_object(q, doc))).unwrap_or(false),
        "$nor" => sub_queries(cond).map(|mut qs| !qs.any(|q| matches_object(q, doc))).unwrap_or(false),
        _ => matches_field(lookup(doc, key), cond),
    })
}

fn sub_queries(cond: &Value) -> Option<impl Iterator<Item = &Map<String, Value>>> {
    let items = cond.as_array()?;
    if items.iter().any(|q| !q.is_object()) {
        return None;
    }
    Some(items.iter().filter_map(Value::as_object))
}

/// Resolve a dotted path like `sample.name` or `hints.dimensions.0`.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn matches_field(value: Option<&Value>, cond: &Value) -> bool {
    if let Some(ops) = cond.as_object() {
        if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, arg)| apply_operator(op, value, arg));
        }
    }
    equals(value, cond)
}

fn apply_operator(op: &str, value: Option<&Value>, arg: &Value) -> bool {
    match op {
        "$eq" => equals(value, arg),
        "$ne" => !equals(value, arg),
        "$gt" => compare_any(value, arg, |o| o == Ordering::Greater),
        "$gte" => compare_any(value, arg, |o| o != Ordering::Less),
        "$lt" => compare_any(value, arg, |o| o == Ordering::Less),
        "$lte" => compare_any(value, arg, |o| o != Ordering::Greater),
        "$in" => arg
            .as_array()
            .map(|options| options.iter().any(|o| equals(value, o)))
            .unwrap_or(false),
        "$nin" => !arg
            .as_array()
            .map(|options| options.iter().any(|o| equals(value, o)))
            .unwrap_or(false),
        "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
        _ => false,
    }
}

/// Field equality; an array field matches if any element matches.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| scalar_eq(item, expected))
        }
        Some(v) => scalar_eq(v, expected),
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_any(value: Option<&Value>, arg: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(item, arg).map(&accept).unwrap_or(false)),
        Some(v) => compare(v, arg).map(&accept).unwrap_or(false),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> Value {
        json!({
            "uid": "3c93c54e-0000",
            "time": 1_580_000_000.0,
            "scan_id": 126360,
            "plan_name": "count",
            "sample": {"name": "Au", "composition": "Au"},
            "detectors": ["det", "img"],
        })
    }

    #[test]
    fn test_parse_python_dict_literal() {
        let query = Query::parse("{'scan_id': 126360}").unwrap();
        assert_eq!(query.as_value(), &json!({"scan_id": 126360}));
        assert!(query.matches(&start()));
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert!(Query::parse("{}").unwrap().matches(&start()));
        assert!(Query::all().matches(&json!({})));
    }

    #[test]
    fn test_parse_rejects_non_mapping() {
        assert!(matches!(Query::parse("[1, 2]"), Err(QueryError::Parse(_))));
        assert!(matches!(Query::parse("{'a': "), Err(QueryError::Parse(_))));
        assert!(matches!(
            Query::parse("{'a': {'$where': 'x'}}"),
            Err(QueryError::UnsupportedOperator(op)) if op == "$where"
        ));
    }

    #[test]
    fn test_dotted_paths_and_arrays() {
        assert!(Query::parse("{'sample.name': 'Au'}").unwrap().matches(&start()));
        assert!(Query::parse("{'detectors': 'img'}").unwrap().matches(&start()));
        assert!(!Query::parse("{'detectors': 'cam'}").unwrap().matches(&start()));
    }

    #[test]
    fn test_comparison_operators() {
        let doc = start();
        assert!(Query::parse(r#"{"scan_id": {"$gte": 100, "$lt": 200000}}"#).unwrap().matches(&doc));
        assert!(!Query::parse(r#"{"scan_id": {"$gt": 126360}}"#).unwrap().matches(&doc));
        assert!(Query::parse(r#"{"plan_name": {"$in": ["scan", "count"]}}"#).unwrap().matches(&doc));
        assert!(Query::parse(r#"{"plan_name": {"$nin": ["scan"]}}"#).unwrap().matches(&doc));
        assert!(Query::parse(r#"{"missing": {"$exists": false}}"#).unwrap().matches(&doc));
        assert!(Query::parse(r#"{"plan_name": {"$ne": "scan"}}"#).unwrap().matches(&doc));
    }

    #[test]
    fn test_logical_operators() {
        let doc = start();
        let or = Query::parse(r#"{"$or": [{"scan_id": 1}, {"plan_name": "count"}]}"#).unwrap();
        assert!(or.matches(&doc));
        let nor = Query::parse(r#"{"$nor": [{"scan_id": 1}, {"plan_name": "count"}]}"#).unwrap();
        assert!(!nor.matches(&doc));

        let combined = Query::and(vec![
            Query::parse("{'plan_name': 'count'}").unwrap(),
            Query::parse("{'sample.name': 'Ag'}").unwrap(),
        ]);
        assert!(!combined.matches(&doc));
    }

    #[test]
    fn test_time_range() {
        let query = Query::parse("TimeRange(since='2020', until='2020-03-01')").unwrap();
        assert_eq!(
            query.as_value(),
            &json!({"time": {"$gte": 1_577_836_800.0, "$lt": 1_583_020_800.0}})
        );
        assert!(query.matches(&start()));

        let since_only = Query::parse("TimeRange(since=\"2020-02\")").unwrap();
        assert_eq!(since_only.as_value(), &json!({"time": {"$gte": 1_580_515_200.0}}));
        assert!(!since_only.matches(&start()));
    }

    #[test]
    fn test_time_range_bad_date() {
        assert!(matches!(
            Query::parse("TimeRange(since='yesterday')"),
            Err(QueryError::Time(_))
        ));
        assert!(matches!(
            Query::parse("TimeRange(since)"),
            Err(QueryError::Parse(_))
        ));
    }

    #[test]
    fn test_time_range_unknown_argument() {
        let err = Query::parse("TimeRange(since='2020', timezone='US/Eastern')").unwrap_err();
        assert!(matches!(&err, QueryError::TimeRangeArgument(key) if key == "timezone"));
        assert!(err.to_string().contains("UTC"));
        assert!(matches!(
            Query::parse("TimeRange(after='2020')"),
            Err(QueryError::TimeRangeArgument(key)) if key == "after"
        ));
    }

    #[test]
    fn test_parse_time_forms() {
        assert_eq!(parse_time("2020-01-01 00:01").unwrap(), 1_577_836_860.0);
        assert_eq!(parse_time("2020-01-01T00:00:01Z").unwrap(), 1_577_836_801.0);
        assert_eq!(parse_time("2020-01-02").unwrap(), 1_577_923_200.0);
    }
}
