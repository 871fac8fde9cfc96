use reqwest::{header, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;

/// Failure reaching or talking to a backend service. `Status` keeps the
/// response body (parsed JSON when possible, raw text otherwise) so the
/// dispatcher can surface the backend's own error message.
#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("{}", render_status_message(.status, .body))]
    Status { status: StatusCode, body: Value },
    #[error("Network error calling downstream service: {0}")]
    Network(#[from] reqwest::Error),
}

fn render_status_message(status: &StatusCode, body: &Value) -> String {
    let detail = body
        .get("error")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| match body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        });

    if detail.is_empty() {
        format!("Downstream request failed with status {}", status.as_u16())
    } else {
        format!(
            "Downstream request failed with status {}: {}",
            status.as_u16(),
            detail
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Authenticated (or public, when `token` is None) JSON request.
    /// Non-2xx responses become `DownstreamError::Status`; an empty 2xx
    /// body is reported as `Value::Null`.
    pub async fn request_json(
        &self,
        base_url: &str,
        path: &str,
        token: Option<&str>,
        method: Method,
        body: Option<Value>,
    ) -> Result<Value, DownstreamError> {
        let response = self.send(base_url, path, token, method, body).await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        let parsed = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            return Err(DownstreamError::Status {
                status,
                body: parsed,
            });
        }

        Ok(parsed)
    }

    /// Same request shape, but the 2xx body is returned as opaque text.
    /// Used for endpoints that serve source code or type definitions.
    pub async fn request_text(
        &self,
        base_url: &str,
        path: &str,
        token: Option<&str>,
        method: Method,
    ) -> Result<String, DownstreamError> {
        let response = self.send(base_url, path, token, method, None).await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            return Err(DownstreamError::Status { status, body });
        }

        Ok(text)
    }

    async fn send(
        &self,
        base_url: &str,
        path: &str,
        token: Option<&str>,
        method: Method,
        body: Option<Value>,
    ) -> Result<reqwest::Response, DownstreamError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let mut request = self
            .http
            .request(method, &url)
            .header(header::CONTENT_TYPE, "application/json");

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        if let Some(body) = body {
            request = request.json(&body);
        }

        Ok(request.send().await?)
    }
}
