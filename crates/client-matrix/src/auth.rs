//! Authentication flow discovery and staged execution.

use client_core::ClientError;
use serde_json::{Value, json};

pub(crate) const LOGIN_PASSWORD: &str = "m.login.password";

/// Inputs the caller supplies to login or register.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
        }
    }
}

/// One executable stage of an authentication flow.
///
/// A stage turns the supplied credentials and the server's `session` token
/// into the next request body; stages run in the order the server declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthStage {
    Password,
}

impl AuthStage {
    fn for_type(flow_type: &str, credentials: &Credentials) -> Option<Self> {
        match flow_type {
            LOGIN_PASSWORD if credentials.user.is_some() && credentials.password.is_some() => {
                Some(Self::Password)
            }
            _ => None,
        }
    }

    pub(crate) fn request_body(
        &self,
        credentials: &Credentials,
        session: Option<&str>,
    ) -> Value {
        let mut body = match self {
            Self::Password => json!({
                "type": LOGIN_PASSWORD,
                "user": credentials.user,
                "password": credentials.password,
            }),
        };
        if let Some(session) = session {
            body["session"] = session.into();
        }
        body
    }
}

/// Pick the first offered login flow the supplied credentials satisfy.
pub(crate) fn select_login_flow(
    body: &Value,
    credentials: &Credentials,
) -> Result<AuthStage, ClientError> {
    let flows = flows_array(body)?;
    flows
        .iter()
        .filter_map(|flow| flow.get("type").and_then(Value::as_str))
        .find_map(|flow_type| AuthStage::for_type(flow_type, credentials))
        .ok_or(ClientError::AuthUnsupported)
}

/// Pick the first offered register flow whose every stage is satisfiable,
/// returning the stages in declared order.
pub(crate) fn select_register_stages(
    body: &Value,
    credentials: &Credentials,
) -> Result<Vec<AuthStage>, ClientError> {
    let flows = flows_array(body)?;
    for flow in flows {
        let stage_types: Vec<&str> = match flow.get("stages").and_then(Value::as_array) {
            Some(stages) => stages.iter().filter_map(Value::as_str).collect(),
            None => flow
                .get("type")
                .and_then(Value::as_str)
                .into_iter()
                .collect(),
        };
        if stage_types.is_empty() {
            continue;
        }

        let stages: Vec<AuthStage> = stage_types
            .iter()
            .filter_map(|stage_type| AuthStage::for_type(stage_type, credentials))
            .collect();
        if stages.len() == stage_types.len() {
            return Ok(stages);
        }
    }
    Err(ClientError::AuthUnsupported)
}

fn flows_array(body: &Value) -> Result<&Vec<Value>, ClientError> {
    body.get("flows")
        .and_then(Value::as_array)
        .ok_or_else(|| ClientError::protocol("flow discovery response missing 'flows'"))
}
