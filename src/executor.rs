use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;
use reqwest::Method;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::substitute::shape;
use crate::substitute::to_text;

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("request has no `url`")]
    MissingUrl,

    #[error("Failed to parse URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("`headers` must be a sequence of key/value pairs, got {0}")]
    HeadersNotASequence(String),

    #[error("header #{0} must be a mapping with `key` and `value`")]
    MalformedHeader(usize),

    #[error("Invalid header name `{0}`")]
    InvalidHeaderName(String),

    #[error("Invalid header value for `{0}`")]
    InvalidHeaderValue(String),

    #[error("failed to set up the HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

/// What came back from one request.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body_text: String,
    /// Parsed body, or an empty mapping when the body is not JSON.
    pub body_json: Value,
}

impl ResponseRecord {
    pub async fn from_response(resp: Response) -> Result<Self, ExecuteError> {
        let status = resp.status();
        let headers = resp.headers().clone();

        // Consume the body exactly once
        let body_text = resp.text().await.map_err(ExecuteError::Transport)?;
        let body_json = try_parse(&body_text).unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Self {
            status,
            headers,
            body_text,
            body_json,
        })
    }

    /// The fields expectations are compared against and response variables are built from.
    pub fn fields(&self) -> Map<String, Value> {
        let mut headers = Map::new();
        for name in self.headers.keys() {
            let value = self
                .headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap_or("<invalid utf8>"))
                .collect::<Vec<_>>()
                .join(", ");
            headers.insert(name.as_str().to_string(), Value::String(value));
        }

        let mut fields = Map::new();
        fields.insert("http_code".into(), Value::from(self.status.as_u16()));
        fields.insert("text".into(), Value::String(self.body_text.clone()));
        fields.insert("json".into(), self.body_json.clone());
        fields.insert("headers".into(), Value::Object(headers));
        fields
    }
}

pub fn try_parse(body: &str) -> Option<Value> {
    serde_json::from_str(body).ok()
}

pub struct Executor {
    client: Client,
}

impl Executor {
    pub fn new(timeout: Option<Duration>) -> Result<Self, ExecuteError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build().map_err(ExecuteError::Client)?,
        })
    }

    /// Sends the request described by `request` (`method`, `url`, `payload`, `headers`).
    pub async fn execute(
        &self,
        request: &Map<String, Value>,
    ) -> Result<ResponseRecord, ExecuteError> {
        let method = parse_method(request.get("method"))?;
        let url = parse_url(request.get("url"))?;
        let headers = parse_headers(request.get("headers"))?;

        debug!(%method, %url, "sending request");

        let builder = self.client.request(method, url).headers(headers);
        let builder = match request.get("payload") {
            None | Some(Value::Null) => builder,
            Some(payload) => builder.json(payload),
        };

        let response = builder.send().await.map_err(ExecuteError::Transport)?;
        let record = ResponseRecord::from_response(response).await?;

        debug!(status = %record.status, bytes = record.body_text.len(), "received response");

        Ok(record)
    }
}

fn parse_method(method: Option<&Value>) -> Result<Method, ExecuteError> {
    let Some(method) = method.filter(|m| !m.is_null()) else {
        return Ok(Method::GET);
    };

    // Extension methods such as PURGE are valid tokens too.
    let method = to_text(method).to_uppercase();
    Method::from_str(&method).map_err(|_| ExecuteError::InvalidMethod(method))
}

fn parse_url(url: Option<&Value>) -> Result<Url, ExecuteError> {
    let Some(url) = url.filter(|u| !u.is_null()) else {
        return Err(ExecuteError::MissingUrl);
    };

    let url = to_text(url);
    Url::parse(&url).map_err(|source| ExecuteError::InvalidUrl { url, source })
}

/// Later entries replace earlier ones with the same name.
fn parse_headers(headers: Option<&Value>) -> Result<HeaderMap, ExecuteError> {
    let mut header_map = HeaderMap::new();

    let entries = match headers {
        None | Some(Value::Null) => return Ok(header_map),
        Some(Value::Array(entries)) => entries,
        Some(other) => return Err(ExecuteError::HeadersNotASequence(shape(other).into())),
    };

    for (index, entry) in entries.iter().enumerate() {
        let (Some(key), Some(value)) = (entry.get("key"), entry.get("value")) else {
            return Err(ExecuteError::MalformedHeader(index));
        };
        let key = to_text(key);

        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| ExecuteError::InvalidHeaderName(key.clone()))?;
        let value = HeaderValue::from_str(&to_text(value))
            .map_err(|_| ExecuteError::InvalidHeaderValue(key.clone()))?;

        header_map.insert(name, value);
    }

    Ok(header_map)
}
