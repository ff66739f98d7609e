use crate::errors::QueryRouterError;
use crate::identity::{LOGGED_USER_FIELD, LoggedUser, extract_logged_user};
use http::request::Parts;
use hyper::body::Bytes;
use serde_json::Value;
use std::fmt;

/// Query parameter selecting the freeze path
pub const FREEZE_PARAM: &str = "freeze";
const SQL_FIELD: &str = "sql";

/// The two inbound operations; both run through the same pipeline and only
/// differ in the adapter endpoint they target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Query,
    Download,
}

impl Operation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Query => "query",
            Operation::Download => "download",
        }
    }

    /// Matches `{prefix}/query` and `{prefix}/download`.
    pub fn from_path(path: &str, prefix: &str) -> Option<Self> {
        match path.strip_prefix(prefix)? {
            "/query" => Some(Operation::Query),
            "/download" => Some(Operation::Download),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound query request with its body read and decoded.
#[derive(Debug)]
pub struct QueryRequest {
    pub operation: Operation,
    pub parts: Parts,
    pub body: Bytes,
    json: Option<Value>,
    params: Vec<(String, String)>,
}

impl QueryRequest {
    pub fn parse(operation: Operation, parts: Parts, body: Bytes) -> Result<Self, QueryRouterError> {
        let params = parts
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let json = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(
                serde_json::from_slice(&body)
                    .map_err(|e| QueryRouterError::RequestBodyError(e.to_string()))?,
            )
        };

        Ok(Self {
            operation,
            parts,
            body,
            json,
            params,
        })
    }

    /// First value of the query parameter `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn freeze(&self) -> bool {
        self.param(FREEZE_PARAM) == Some("true")
    }

    /// The SQL from the query string, else from the body.
    pub fn sql(&self) -> Option<&str> {
        self.param(SQL_FIELD).or_else(|| {
            self.json
                .as_ref()
                .and_then(|body| body.get(SQL_FIELD))
                .and_then(Value::as_str)
        })
    }

    pub fn logged_user(&self) -> Result<Option<LoggedUser>, QueryRouterError> {
        extract_logged_user(self.json.as_ref(), self.param(LOGGED_USER_FIELD))
    }

    /// The query string to forward upstream: everything except the parameters
    /// this gateway consumes itself.
    pub fn forwarded_query(&self) -> Option<String> {
        let forwarded: Vec<_> = self
            .params
            .iter()
            .filter(|(key, _)| key != FREEZE_PARAM && key != LOGGED_USER_FIELD)
            .collect();

        if forwarded.is_empty() {
            return None;
        }

        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(forwarded)
                .finish(),
        )
    }
}
