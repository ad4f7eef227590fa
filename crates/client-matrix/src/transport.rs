use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use client_core::ClientError;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;
use url::Url;

/// Characters escaped when a Matrix identifier lands in a URL path segment.
/// Room aliases start with `#` and ids contain `/`-adjacent separators, so
/// the set is wider than the bare path-invalid characters.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Percent-encode one path segment of a request path.
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Narrow contract over the HTTP/JSON wire.
///
/// Paths are relative to the configured API prefix; the implementation owns
/// URL building and `access_token` injection. An empty response body
/// (including the literal `""`) yields `None`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Option<Value>, ClientError>;

    async fn put_json(&self, path: &str, body: &Value) -> Result<Option<Value>, ClientError>;

    async fn post_json(&self, path: &str, body: &Value) -> Result<Option<Value>, ClientError>;

    async fn delete_json(&self, path: &str) -> Result<Option<Value>, ClientError>;

    /// Attach the token appended to every subsequent request.
    fn set_access_token(&self, token: &str);
}

/// `reqwest`-backed [`Transport`].
///
/// The underlying client carries no global timeout so the event long-poll
/// can outlive ordinary requests; callers bound individual requests
/// themselves. Connection pooling lets commands run beside the long-poll.
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
    path_prefix: String,
    access_token: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(server: &str, path_prefix: &str) -> Result<Self, ClientError> {
        let base = Url::parse(server)
            .map_err(|err| ClientError::protocol(format!("invalid homeserver URL '{server}': {err}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| ClientError::transport(err.to_string()))?;

        Ok(Self {
            http,
            base,
            path_prefix: path_prefix.trim_end_matches('/').to_owned(),
            access_token: RwLock::new(None),
        })
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}{path}", self.path_prefix));
        url.set_query(None);

        let token = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !query.is_empty() || token.is_some() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if let Some(token) = &token {
                pairs.append_pair("access_token", token);
            }
        }
        url
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Option<Value>, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::transport(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ClientError::transport(err.to_string()))?;

        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: error_message(&bytes),
            });
        }
        parse_body(&bytes)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Option<Value>, ClientError> {
        let url = self.build_url(path, query);
        self.execute(self.http.get(url)).await
    }

    async fn put_json(&self, path: &str, body: &Value) -> Result<Option<Value>, ClientError> {
        let url = self.build_url(path, &[]);
        self.execute(self.http.put(url).json(body)).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Option<Value>, ClientError> {
        let url = self.build_url(path, &[]);
        self.execute(self.http.post(url).json(body)).await
    }

    async fn delete_json(&self, path: &str) -> Result<Option<Value>, ClientError> {
        let url = self.build_url(path, &[]);
        self.execute(self.http.delete(url)).await
    }

    fn set_access_token(&self, token: &str) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.to_owned());
    }
}

/// Decode a success body: empty (or the literal `""`) means no payload,
/// anything else must be JSON.
fn parse_body(bytes: &[u8]) -> Result<Option<Value>, ClientError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| ClientError::transport(format!("non-JSON response body: {err}")))?;
    match value {
        Value::String(text) if text.is_empty() => Ok(None),
        value => Ok(Some(value)),
    }
}

/// Pull a readable message out of a Matrix error body.
fn error_message(bytes: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        let errcode = value.get("errcode").and_then(Value::as_str);
        let error = value.get("error").and_then(Value::as_str);
        match (errcode, error) {
            (Some(code), Some(message)) => return format!("{code}: {message}"),
            (Some(code), None) => return code.to_owned(),
            (None, Some(message)) => return message.to_owned(),
            (None, None) => {}
        }
    }
    String::from_utf8_lossy(bytes).trim().to_owned()
}
