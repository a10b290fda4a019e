use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::api::{ApiError, ApiGateway, ApiRequest, Method, Transport};
use crate::auth::CredentialManager;
use crate::config::Credentials;

#[derive(Default)]
pub(crate) struct FakeTransport {
    routes: Mutex<HashMap<(Method, String), Result<Value, ApiError>>>,
    calls: Mutex<Vec<ApiRequest>>,
    delays: Mutex<HashMap<(Method, String), VecDeque<Duration>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, method: Method, path: &str, body: Value) {
        self.routes.lock().insert((method, path.to_string()), Ok(body));
    }

    pub(crate) fn fail(&self, method: Method, path: &str, status: u16) {
        self.routes.lock().insert(
            (method, path.to_string()),
            Err(ApiError::Status {
                status,
                message: "scripted failure".to_string(),
            }),
        );
    }

    /// The next matching requests answer after these delays, one per call.
    pub(crate) fn delay_next(&self, method: Method, path: &str, delays: &[Duration]) {
        self.delays
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .extend(delays.iter().copied());
    }

    pub(crate) fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    pub(crate) fn bodies(&self, method: Method, path: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .filter_map(|call| call.body.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let key = (request.method, request.path.clone());
        self.calls.lock().push(request);
        let delay = self.delays.lock().get_mut(&key).and_then(VecDeque::pop_front);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.routes
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| {
                Err(ApiError::Status {
                    status: 404,
                    message: format!("no route for {:?} {}", key.0, key.1),
                })
            })
    }
}

pub(crate) fn test_credentials() -> Credentials {
    Credentials {
        username: "user@example.com".to_string(),
        password: "hunter2".to_string(),
    }
}

pub(crate) fn token_response(access: &str, expires_in: f64) -> Value {
    json!({
        "accessToken": access,
        "refreshToken": format!("refresh-{access}"),
        "expiresIn": expires_in,
    })
}

pub(crate) async fn logged_in_gateway(transport: &Arc<FakeTransport>) -> ApiGateway {
    transport.respond(
        Method::Post,
        "/api/accounts/login",
        token_response("access-1", 3600.0),
    );
    let credentials = Arc::new(CredentialManager::new(transport.clone(), test_credentials()));
    credentials.login().await.expect("scripted login");
    ApiGateway::new(transport.clone(), credentials)
}
