//! Mock responses for paths carrying the mock marker
//!
//! The document only depends on the request, so repeated calls with the
//! same input produce byte-identical output.

use crate::proxy::url_resolver::RoutedPath;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockEcho {
    pub mock: bool,
    pub code: String,
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Value,
}

impl MockEcho {
    pub fn new(method: &str, routed: &RoutedPath, body: &[u8]) -> Self {
        Self {
            mock: true,
            code: routed.code.to_string(),
            method: method.to_string(),
            path: format!("/{}", routed.remainder),
            query: parse_query(routed.query.as_deref()),
            body: echo_body(body),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        // Only strings, maps and JSON values; serialization cannot fail
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.to_string(), value.to_string())
        })
        .collect()
}

fn echo_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }

    serde_json::from_slice(body).unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(body).into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::url_resolver::UrlResolver;

    fn routed(path: &str) -> RoutedPath {
        UrlResolver::route(&path.parse().unwrap()).unwrap()
    }

    #[test]
    fn echoes_method_path_query_and_json_body() {
        let echo = MockEcho::new("POST", &routed("/ab12cd/__mock__/orders?b=2&a=1"), br#"{"n":1}"#);
        let json: Value = serde_json::from_slice(&echo.to_bytes()).unwrap();

        assert_eq!(json["mock"], true);
        assert_eq!(json["code"], "ab12cd");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/__mock__/orders");
        assert_eq!(json["query"]["a"], "1");
        assert_eq!(json["query"]["b"], "2");
        assert_eq!(json["body"]["n"], 1);
    }

    #[test]
    fn output_is_deterministic() {
        let first = MockEcho::new("GET", &routed("/ab12cd/__mock__?z=1&a=2"), b"text").to_bytes();
        let second = MockEcho::new("GET", &routed("/ab12cd/__mock__?z=1&a=2"), b"text").to_bytes();
        assert_eq!(first, second);
    }

    #[test]
    fn non_json_body_is_echoed_as_string() {
        let echo = MockEcho::new("PUT", &routed("/ab12cd/__mock__"), b"plain");
        assert_eq!(echo.body, Value::String("plain".to_string()));

        let empty = MockEcho::new("GET", &routed("/ab12cd/__mock__"), b"");
        assert_eq!(empty.body, Value::Null);
    }
}
