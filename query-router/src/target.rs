use crate::errors::QueryRouterError;
use crate::request::{Operation, QueryRequest};
use http::header::{CONTENT_LENGTH, HOST};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{HeaderMap, Method, Request, Version};
use shared::http::{add_via_header, filter_hop_by_hop};
use url::Url;

/// The request to reissue against the query adapter.
///
/// Built once per inbound request and consumed by either the relay or the
/// freeze pipeline.
#[derive(Clone, Debug)]
pub struct QueryTarget {
    pub operation: Operation,
    pub dataset_id: String,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl QueryTarget {
    /// Resolves the dataset referenced by the request's SQL and points the
    /// request at `{adapter_url}/{operation}/{dataset_id}`.
    pub fn derive(request: &QueryRequest, adapter_url: &Url) -> Result<Self, QueryRouterError> {
        let sql = request.sql().ok_or_else(|| {
            QueryRouterError::DatasetUnresolved("request carries no sql".to_string())
        })?;
        let dataset_id = table_of_sql(sql).ok_or_else(|| {
            QueryRouterError::DatasetUnresolved(format!("no table referenced by sql: {sql}"))
        })?;

        let mut url = adapter_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                QueryRouterError::InternalError(format!("adapter url cannot be a base: {adapter_url}"))
            })?
            .pop_if_empty()
            .extend([request.operation.as_str(), dataset_id.as_str()]);
        url.set_query(request.forwarded_query().as_deref());

        let mut headers = request.parts.headers.clone();
        filter_hop_by_hop(&mut headers, request.parts.version);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        add_via_header(&mut headers, request.parts.version);

        Ok(Self {
            operation: request.operation,
            dataset_id,
            method: Method::POST,
            url,
            headers,
            body: request.body.clone(),
        })
    }

    /// Upstream identifier used in errors and logs.
    pub fn upstream_identifier(&self) -> &str {
        self.url.host_str().unwrap_or(self.url.as_str())
    }

    pub fn to_request(&self) -> Result<Request<Full<Bytes>>, QueryRouterError> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str())
            .version(Version::HTTP_11);

        for (name, value) in self.headers.iter() {
            builder = builder.header(name, value);
        }

        builder
            .body(Full::new(self.body.clone()))
            .map_err(|e| QueryRouterError::InternalError(format!("Failed to build request: {e}")))
    }
}

/// Returns the first table referenced after a `FROM` keyword.
///
/// Only this table is authorized. Further tables, e.g. on the right of a
/// `UNION` or `JOIN`, are not looked up.
///
/// Subqueries in the `FROM` position are descended into, quoted identifiers
/// are unquoted, and keywords inside string literals are ignored.
pub fn table_of_sql(sql: &str) -> Option<String> {
    let tokens = tokenize(sql);
    let mut iter = tokens.iter().peekable();

    while let Some(token) = iter.next() {
        if !token.eq_ignore_ascii_case("from") {
            continue;
        }
        match iter.peek() {
            Some(next) if next.as_str() == "(" => continue,
            Some(next) => {
                let table = unquote(next);
                if !table.is_empty() {
                    return Some(table.to_string());
                }
            }
            None => return None,
        }
    }

    None
}

fn tokenize(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '`' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | ')' | ',' | ';' => {
                flush(&mut tokens, &mut current);
                tokens.push(c.to_string());
            }
            c if c.is_whitespace() => flush(&mut tokens, &mut current),
            c => current.push(c),
        }
    }
    flush(&mut tokens, &mut current);

    tokens
}

fn flush(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}

fn unquote(token: &str) -> &str {
    for q in ['"', '`'] {
        if let Some(inner) = token
            .strip_prefix(q)
            .and_then(|rest| rest.strip_suffix(q))
        {
            return inner;
        }
    }
    if token.starts_with('\'') || token == "(" || token == ")" || token == "," || token == ";" {
        return "";
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{CONNECTION, CONTENT_TYPE, VIA};

    #[test]
    fn test_table_of_sql() {
        let cases = [
            ("SELECT * FROM 42", Some("42")),
            ("select count(*) from my_table where a = 1", Some("my_table")),
            (
                r#"SELECT * FROM "098b33df-6871-4e53-a5ff-b56a7d989f9a" LIMIT 1"#,
                Some("098b33df-6871-4e53-a5ff-b56a7d989f9a"),
            ),
            ("SELECT * FROM `quoted`", Some("quoted")),
            ("SELECT * FROM (SELECT a FROM inner_table) t", Some("inner_table")),
            ("SELECT 'from x' AS label FROM real_table", Some("real_table")),
            ("SELECT * FROM\n\tspaced;", Some("spaced")),
            (
                "SELECT * FROM open_ds UNION SELECT * FROM restricted_ds",
                Some("open_ds"),
            ),
            ("SELECT 1", None),
            ("SELECT * FROM", None),
            ("", None),
        ];

        for (sql, expected) in cases {
            assert_eq!(table_of_sql(sql).as_deref(), expected, "{sql}");
        }
    }

    fn query_request(uri: &str, body: &str) -> QueryRequest {
        let (parts, _) = Request::post(uri)
            .header(HOST, "gateway.local")
            .header(CONNECTION, "keep-alive")
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body.len())
            .body(())
            .unwrap()
            .into_parts();
        QueryRequest::parse(Operation::Download, parts, Bytes::from(body.to_string())).unwrap()
    }

    #[test]
    fn test_derive() {
        let request = query_request(
            "/download?sql=SELECT+*+FROM+42&format=csv&freeze=true",
            r#"{"loggedUser": {"role": "ADMIN"}}"#,
        );
        let adapter = Url::parse("http://adapter:8080/v1/").unwrap();
        let target = QueryTarget::derive(&request, &adapter).unwrap();

        assert_eq!(target.dataset_id, "42");
        assert_eq!(target.method, Method::POST);
        assert_eq!(
            target.url.as_str(),
            "http://adapter:8080/v1/download/42?sql=SELECT+*+FROM+42&format=csv"
        );
        assert_eq!(target.upstream_identifier(), "adapter");
        assert!(target.headers.get(HOST).is_none());
        assert!(target.headers.get(CONNECTION).is_none());
        assert!(target.headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(target.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(target.headers.contains_key(VIA));
        assert_eq!(target.body, request.body);

        let upstream = target.to_request().unwrap();
        assert_eq!(upstream.uri().path(), "/v1/download/42");
    }

    #[test]
    fn test_derive_without_sql() {
        let request = query_request("/query", "");
        let adapter = Url::parse("http://adapter:8080").unwrap();
        assert!(matches!(
            QueryTarget::derive(&request, &adapter),
            Err(QueryRouterError::DatasetUnresolved(_))
        ));
    }
}
