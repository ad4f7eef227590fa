//! Scripted transport and notice helpers shared by the scenario tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use client_core::{ClientError, Notice, NoticeStream};
use client_matrix::Transport;
use serde_json::Value;

/// One request the client issued against the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

struct Script {
    method: &'static str,
    path: String,
    result: Result<Option<Value>, ClientError>,
}

/// Scripted [`Transport`]: responses are matched by method and path in
/// script order; a request with no matching script parks forever, which
/// keeps an idle long-poll from consuming scripts meant for commands.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<RecordedRequest>>,
    token: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for the next request matching `method` and `path`.
    pub fn expect(
        &self,
        method: &'static str,
        path: &str,
        result: Result<Option<Value>, ClientError>,
    ) {
        self.scripts
            .lock()
            .expect("script lock should not be poisoned")
            .push_back(Script {
                method,
                path: path.to_owned(),
                result,
            });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .expect("request lock should not be poisoned")
            .clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }

    pub fn access_token(&self) -> Option<String> {
        self.token
            .lock()
            .expect("token lock should not be poisoned")
            .clone()
    }

    async fn handle(
        &self,
        method: &'static str,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, ClientError> {
        self.requests
            .lock()
            .expect("request lock should not be poisoned")
            .push(RecordedRequest {
                method,
                path: path.to_owned(),
                query: query.to_vec(),
                body: body.cloned(),
            });

        let script = {
            let mut scripts = self
                .scripts
                .lock()
                .expect("script lock should not be poisoned");
            scripts
                .iter()
                .position(|script| script.method == method && script.path == path)
                .and_then(|index| scripts.remove(index))
        };

        match script {
            Some(script) => script.result,
            None => {
                // Unscripted request: park like a server that never answers.
                std::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Option<Value>, ClientError> {
        self.handle("GET", path, query, None).await
    }

    async fn put_json(&self, path: &str, body: &Value) -> Result<Option<Value>, ClientError> {
        self.handle("PUT", path, &[], Some(body)).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Option<Value>, ClientError> {
        self.handle("POST", path, &[], Some(body)).await
    }

    async fn delete_json(&self, path: &str) -> Result<Option<Value>, ClientError> {
        self.handle("DELETE", path, &[], None).await
    }

    fn set_access_token(&self, token: &str) {
        *self
            .token
            .lock()
            .expect("token lock should not be poisoned") = Some(token.to_owned());
    }
}

/// Receive the next notice, failing the test after a generous timeout.
pub async fn next_notice(stream: &mut NoticeStream) -> Notice {
    tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("timed out waiting for a notice")
        .expect("notice stream closed")
}
