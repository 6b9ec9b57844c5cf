//! ureq-backed registry client.
//!
//! One agent per run. Client credentials are exchanged for a bearer token once
//! in `connect`; the token is never logged.
use super::{unwrap_envelope, RegistryApi};
use crate::error::{ReconcileError, ReconcileResult};
use crate::retry::RetryPolicy;
use crate::util::{elapsed_ms, truncate_string};
use serde_json::{json, Value};
use std::fmt;
use std::time::{Duration, Instant};
use ureq::Agent;

const ERROR_BODY_MAX_BYTES: usize = 400;

#[derive(Clone)]
pub enum RegistryCredential {
    Bearer(String),
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryCredential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            RegistryCredential::ClientCredentials { client_id, .. } => f
                .debug_struct("ClientCredentials")
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConnection {
    pub api_base_url: String,
    pub credential: RegistryCredential,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
    Put,
    Patch,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
        }
    }
}

pub struct HttpRegistry {
    agent: Agent,
    api_base_url: String,
    authorization: String,
    retry: RetryPolicy,
}

impl HttpRegistry {
    /// Build the agent and resolve a bearer token. A rejected credential
    /// exchange is an `Auth` error.
    pub fn connect(connection: &RegistryConnection) -> ReconcileResult<Self> {
        let config = Agent::config_builder()
            .timeout_global(Some(connection.timeout))
            .http_status_as_error(false)
            .build();
        let agent = Agent::new_with_config(config);
        let api_base_url = connection.api_base_url.trim_end_matches('/').to_string();

        let token = match &connection.credential {
            RegistryCredential::Bearer(token) => token.clone(),
            RegistryCredential::ClientCredentials {
                client_id,
                client_secret,
            } => {
                let url = format!("{api_base_url}/v1/auth/access_token");
                let body = json!({ "clientId": client_id, "clientSecret": client_secret });
                let (status, text) = connection.retry.run("registry token exchange", None, || {
                    let (status, text) = send(&agent, Method::Post, &url, None, Some(&body))?;
                    if is_retryable_status(status) {
                        return Err(classify_status(status, "POST /v1/auth/access_token", &text));
                    }
                    Ok((status, text))
                })?;
                if !(200..300).contains(&status) {
                    return Err(match status {
                        400 | 401 | 403 | 422 => ReconcileError::Auth(format!(
                            "credential exchange rejected with HTTP {status}"
                        )),
                        _ => classify_status(status, "POST /v1/auth/access_token", &text),
                    });
                }
                let parsed = parse_body(&text)?;
                parsed
                    .get("accessToken")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ReconcileError::Auth("credential exchange returned no accessToken".to_string())
                    })?
            }
        };
        if token.trim().is_empty() {
            return Err(ReconcileError::Auth("registry bearer token is empty".to_string()));
        }

        Ok(HttpRegistry {
            agent,
            api_base_url,
            authorization: format!("Bearer {}", token.trim()),
            retry: connection.retry,
        })
    }

    /// Issue one logical request with retry. `Ok(None)` means HTTP 404.
    fn request(&self, method: Method, path: &str, body: Option<&Value>) -> ReconcileResult<Option<Value>> {
        let url = format!("{}/v1/{path}", self.api_base_url);
        let label = format!("{} /v1/{path}", method.as_str());
        self.retry.run(&label, None, || {
            let started = Instant::now();
            let (status, text) = send(&self.agent, method, &url, Some(&self.authorization), body)?;
            tracing::info!(
                elapsed_ms = elapsed_ms(started),
                method = method.as_str(),
                path,
                status,
                "registry request complete"
            );
            match status {
                200..=299 => parse_body(&text).map(Some),
                404 => Ok(None),
                _ => Err(classify_status(status, &label, &text)),
            }
        })
    }

    fn read(&self, path: &str, envelope: &[&str]) -> ReconcileResult<Option<Value>> {
        Ok(self
            .request(Method::Get, path, None)?
            .map(|value| unwrap_envelope(value, envelope)))
    }

    fn write(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        envelope: &[&str],
    ) -> ReconcileResult<Value> {
        let value = self.request(method, path, Some(body))?.ok_or_else(|| {
            ReconcileError::Conflict(format!("{} /v1/{path}: resource not found", method.as_str()))
        })?;
        Ok(unwrap_envelope(value, envelope))
    }
}

fn send(
    agent: &Agent,
    method: Method,
    url: &str,
    authorization: Option<&str>,
    body: Option<&Value>,
) -> ReconcileResult<(u16, String)> {
    let result = match method {
        Method::Get => {
            let mut request = agent.get(url).header("Accept", "application/json");
            if let Some(authorization) = authorization {
                request = request.header("Authorization", authorization);
            }
            request.call()
        }
        Method::Post | Method::Put | Method::Patch => {
            let mut request = match method {
                Method::Post => agent.post(url),
                Method::Put => agent.put(url),
                _ => agent.patch(url),
            }
            .header("Accept", "application/json");
            if let Some(authorization) = authorization {
                request = request.header("Authorization", authorization);
            }
            request.send_json(body.unwrap_or(&Value::Null))
        }
    };
    let mut response = result
        .map_err(|err| ReconcileError::Transient(format!("{} {url}: {err}", method.as_str())))?;
    let status = response.status().as_u16();
    let text = response
        .body_mut()
        .read_to_string()
        .map_err(|err| ReconcileError::Transient(format!("read response from {url}: {err}")))?;
    Ok((status, text))
}

fn parse_body(text: &str) -> ReconcileResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(text).map_err(|err| {
        ReconcileError::Fatal(format!(
            "registry returned invalid JSON ({err}): {}",
            truncate_string(text, ERROR_BODY_MAX_BYTES)
        ))
    })
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn classify_status(status: u16, label: &str, body: &str) -> ReconcileError {
    let message = format!(
        "{label}: HTTP {status}: {}",
        truncate_string(body.trim(), ERROR_BODY_MAX_BYTES)
    );
    match status {
        401 => ReconcileError::Auth(message),
        403 => ReconcileError::Permission(message),
        400 | 422 => ReconcileError::Validation(message),
        409 => ReconcileError::Conflict(message),
        status if is_retryable_status(status) => ReconcileError::Transient(message),
        _ => ReconcileError::Fatal(message),
    }
}

impl RegistryApi for HttpRegistry {
    fn get_blueprint(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        self.read(&format!("blueprints/{identifier}"), &["blueprint"])
    }

    fn create_blueprint(&self, document: &Value) -> ReconcileResult<Value> {
        self.write(Method::Post, "blueprints", document, &["blueprint"])
    }

    fn replace_blueprint(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        self.write(
            Method::Put,
            &format!("blueprints/{identifier}"),
            document,
            &["blueprint"],
        )
    }

    fn get_webhook(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        self.read(&format!("webhooks/{identifier}"), &["integration", "webhook"])
    }

    fn create_webhook(&self, document: &Value) -> ReconcileResult<Value> {
        self.write(Method::Post, "webhooks", document, &["integration", "webhook"])
    }

    fn update_webhook(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        self.write(
            Method::Patch,
            &format!("webhooks/{identifier}"),
            document,
            &["integration", "webhook"],
        )
    }

    fn get_integration(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        self.read(&format!("integration/{identifier}"), &["integration"])
    }

    fn create_integration(&self, document: &Value) -> ReconcileResult<Value> {
        self.write(Method::Post, "integration", document, &["integration"])
    }

    fn update_integration(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        self.write(
            Method::Patch,
            &format!("integration/{identifier}"),
            document,
            &["integration"],
        )
    }

    fn update_integration_config(&self, identifier: &str, config: &Value) -> ReconcileResult<Value> {
        self.write(
            Method::Patch,
            &format!("integration/{identifier}/config"),
            &json!({ "config": config }),
            &["integration"],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn status_codes_map_to_error_kinds() {
        let cases = [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Permission),
            (400, ErrorKind::Validation),
            (422, ErrorKind::Validation),
            (409, ErrorKind::Conflict),
            (429, ErrorKind::Transient),
            (503, ErrorKind::Transient),
            (418, ErrorKind::Fatal),
        ];
        for (status, kind) in cases {
            assert_eq!(classify_status(status, "GET /v1/x", "").kind(), kind, "status {status}");
        }
    }

    #[test]
    fn error_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        let err = classify_status(500, "GET /v1/x", &body);
        assert!(err.message().len() < 500);
    }

    #[test]
    fn empty_success_body_parses_as_object() {
        assert_eq!(parse_body("  ").expect("empty body"), json!({}));
        assert!(parse_body("<html>").is_err());
    }

    #[test]
    fn credential_debug_hides_secrets() {
        let credential = RegistryCredential::ClientCredentials {
            client_id: "id-1".to_string(),
            client_secret: "s3cr3t".to_string(),
        };
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("id-1"));
        assert!(!rendered.contains("s3cr3t"));
        assert!(!format!("{:?}", RegistryCredential::Bearer("tok".into())).contains("tok"));
    }
}
