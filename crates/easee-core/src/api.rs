use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::auth::CredentialManager;
use crate::fields::ChargerCommand;
use crate::model::{Charger, ConfigSnapshot, SessionRecord, Site, StatusSnapshot};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("http {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("no usable access token: {0}")]
    Unauthenticated(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            bearer: None,
            body: Some(body),
        }
    }
}

/// One round trip to the vendor REST API. Paths are relative to the base URL.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<Value, ApiError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Transport(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self
                .client
                .post(&url)
                .json(request.body.as_ref().unwrap_or(&json!({}))),
        };
        if let Some(token) = request.bearer.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        if !status.is_success() {
            let message = if text.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            };
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Authenticated access to the charger endpoints. Cheap to clone.
#[derive(Clone)]
pub struct ApiGateway {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialManager>,
}

impl ApiGateway {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<CredentialManager>) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub async fn request(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let token = self
            .credentials
            .access_token()
            .await
            .map_err(|err| ApiError::Unauthenticated(err.to_string()))?;

        let request = ApiRequest {
            method,
            path: path.to_string(),
            bearer: Some(token),
            body: match method {
                Method::Get => None,
                Method::Post => Some(body.unwrap_or_else(|| json!({}))),
            },
        };
        let response = self.transport.execute(request).await?;
        debug!(%path, response = %response, "api response");
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let value = self.request(path, Method::Get, None).await?;
        serde_json::from_value(value).map_err(|err| ApiError::Decode(format!("{path}: {err}")))
    }

    pub async fn list_chargers(&self) -> Result<Vec<Charger>, ApiError> {
        let value = self.request("/api/chargers", Method::Get, None).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value).map_err(|err| ApiError::Decode(format!("/api/chargers: {err}")))
    }

    pub async fn charger_state(&self, charger_id: &str) -> Result<StatusSnapshot, ApiError> {
        self.get_json(&format!("/api/chargers/{charger_id}/state")).await
    }

    pub async fn charger_config(&self, charger_id: &str) -> Result<ConfigSnapshot, ApiError> {
        self.get_json(&format!("/api/chargers/{charger_id}/config")).await
    }

    pub async fn charger_site(&self, charger_id: &str) -> Result<Site, ApiError> {
        self.get_json(&format!("/api/chargers/{charger_id}/site")).await
    }

    pub async fn monthly_sessions(&self, charger_id: &str) -> Result<Vec<SessionRecord>, ApiError> {
        self.get_json(&format!("/api/sessions/charger/{charger_id}/monthly"))
            .await
    }

    pub async fn send_command(
        &self,
        charger_id: &str,
        command: ChargerCommand,
    ) -> Result<Value, ApiError> {
        let path = format!("/api/chargers/{charger_id}/commands/{}", command.endpoint());
        self.request(&path, Method::Post, None).await
    }

    pub async fn update_settings(
        &self,
        charger_id: &str,
        settings: Map<String, Value>,
    ) -> Result<Value, ApiError> {
        let path = format!("/api/chargers/{charger_id}/settings");
        self.request(&path, Method::Post, Some(Value::Object(settings)))
            .await
    }

    pub async fn update_circuit(
        &self,
        site_id: i64,
        circuit_id: i64,
        settings: Map<String, Value>,
    ) -> Result<Value, ApiError> {
        let path = format!("/api/sites/{site_id}/circuits/{circuit_id}/settings");
        self.request(&path, Method::Post, Some(Value::Object(settings)))
            .await
    }
}
