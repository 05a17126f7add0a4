//! Controller-backed configuration source
//!
//! Talks JSON over HTTP to the management controller. Transport failures,
//! timeouts, 5xx and 429 responses are retryable; 404 means the device is
//! unknown; any other 4xx is a permanent rejection. Enrolling a device the
//! controller already knows (409) counts as done.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::source::{ConfigError, ConfigSource, SourceKind};
use super::ConfigDocument;
use crate::models::DeviceIdentity;

/// Device record as listed by the controller
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DeviceRecord {
    id: String,
    #[serde(default)]
    onboard: Option<String>,
}

/// Onboarding request body
#[derive(Clone, Debug, Serialize)]
struct OnboardRequest<'a> {
    onboard_id: String,
    serial: String,
    model: &'a str,
    cert: &'a str,
}

/// Map a response status to an error, if it is one
fn classify_status(status: StatusCode, context: &str, body: &str) -> Option<ConfigError> {
    if status.is_success() {
        return None;
    }
    let message = format!("{} returned {}: {}", context, status.as_u16(), body.trim());
    Some(if status == StatusCode::NOT_FOUND {
        ConfigError::NotFound(message)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ConfigError::Retryable(message)
    } else {
        ConfigError::Permanent(message)
    })
}

fn classify_transport(err: reqwest::Error, context: &str) -> ConfigError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ConfigError::Retryable(format!("{context}: {err}"))
    } else {
        ConfigError::Permanent(format!("{context}: {err}"))
    }
}

/// Controller HTTP client
#[derive(Clone)]
pub struct ControllerSource {
    client: Client,
    base_url: String,
    serial: String,
}

impl ControllerSource {
    /// Create a client for the controller at `base_url`
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ConfigError::Permanent(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            serial: String::new(),
        })
    }

    /// Serial number reported when onboarding
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Send a request, classifying transport failures only
    async fn dispatch(request: RequestBuilder, context: &str) -> Result<Response, ConfigError> {
        debug!("Controller request: {}", context);
        request
            .send()
            .await
            .map_err(|e| classify_transport(e, context))
    }

    /// Send a request and turn failures into classified errors
    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response, ConfigError> {
        let response = Self::dispatch(request, context).await?;
        Self::check(response, context).await
    }

    async fn check(response: Response, context: &str) -> Result<Response, ConfigError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match classify_status(status, context, &body) {
            Some(err) => Err(err),
            None => Err(ConfigError::Permanent(format!("{context}: unexpected status {status}"))),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: Response,
        context: &str,
    ) -> Result<T, ConfigError> {
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(e, context))?;
        serde_json::from_str(&body).map_err(|e| ConfigError::Parse {
            location: context.to_string(),
            message: e.to_string(),
        })
    }

    /// Find the controller's id for a device by its onboarding id
    async fn resolve(&self, identity: &DeviceIdentity) -> Result<String, ConfigError> {
        let url = self.build_url("/api/v1/devices");
        let context = format!("GET {url}?onboard={}", identity.onboard_id);
        let response = self
            .send(
                self.client
                    .get(&url)
                    .query(&[("onboard", identity.onboard_id.to_string())]),
                &context,
            )
            .await?;

        let devices: Vec<DeviceRecord> = Self::read_json(response, &context).await?;
        devices
            .into_iter()
            .next()
            .map(|d| d.id)
            .ok_or_else(|| ConfigError::NotFound(format!("no device onboarded as {}", identity.onboard_id)))
    }
}

#[async_trait]
impl ConfigSource for ControllerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Controller
    }

    async fn fetch(&self, identity: &DeviceIdentity) -> Result<ConfigDocument, ConfigError> {
        let device_id = self.resolve(identity).await?;
        let url = self.build_url(&format!("/api/v1/devices/{device_id}/config"));
        let context = format!("GET {url}");

        let response = self.send(self.client.get(&url), &context).await?;
        Self::read_json(response, &context).await
    }

    async fn commit(
        &self,
        identity: &DeviceIdentity,
        document: &ConfigDocument,
    ) -> Result<(), ConfigError> {
        let device_id = self.resolve(identity).await?;
        let url = self.build_url(&format!("/api/v1/devices/{device_id}/config/sync"));
        let context = format!("POST {url}");

        self.send(self.client.post(&url).json(document), &context)
            .await?;
        info!("Synced config v{} to controller for {}", document.version, device_id);
        Ok(())
    }

    async fn register(
        &self,
        identity: &DeviceIdentity,
        onboard_cert_pem: &str,
    ) -> Result<(), ConfigError> {
        let url = self.build_url("/api/v1/onboard");
        let context = format!("POST {url}");
        let body = OnboardRequest {
            onboard_id: identity.onboard_id.to_string(),
            serial: self.serial.clone(),
            model: &identity.model,
            cert: onboard_cert_pem,
        };

        let response = Self::dispatch(self.client.post(&url).json(&body), &context).await?;
        if response.status() == StatusCode::CONFLICT {
            info!("Device {} already onboarded", identity.onboard_id);
            return Ok(());
        }
        Self::check(response, &context).await?;
        info!("Onboarded device {} with the controller", identity.onboard_id);
        Ok(())
    }

    async fn unregister(&self, identity: &DeviceIdentity) -> Result<(), ConfigError> {
        match self.resolve(identity).await {
            Ok(device_id) => {
                let url = self.build_url(&format!("/api/v1/devices/{device_id}"));
                self.send(self.client.delete(&url), &format!("DELETE {url}"))
                    .await?;
            }
            Err(e) if e.is_not_found() => debug!("Device {} not registered", identity),
            Err(e) => return Err(e),
        }

        let url = self.build_url(&format!("/api/v1/onboard/{}", identity.onboard_id));
        match self.send(self.client.delete(&url), &format!("DELETE {url}")).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_classify_status() {
        let err = |code: u16| classify_status(StatusCode::from_u16(code).unwrap(), "GET /x", "");

        assert!(err(200).is_none());
        assert!(err(204).is_none());
        assert!(matches!(err(404), Some(ConfigError::NotFound(_))));
        assert!(matches!(err(429), Some(ConfigError::Retryable(_))));
        assert!(matches!(err(500), Some(ConfigError::Retryable(_))));
        assert!(matches!(err(503), Some(ConfigError::Retryable(_))));
        assert!(matches!(err(400), Some(ConfigError::Permanent(_))));
        assert!(matches!(err(409), Some(ConfigError::Permanent(_))));
        assert!(matches!(err(422), Some(ConfigError::Permanent(_))));
    }

    #[test]
    fn test_build_url() {
        let source = ControllerSource::new("https://mydomain.adam:3333/", 5).unwrap();
        assert_eq!(
            source.build_url("/api/v1/onboard"),
            "https://mydomain.adam:3333/api/v1/onboard"
        );
    }

    mod stub {
        //! Local controller answering canned responses by `METHOD /path`

        use axum::body::Bytes;
        use axum::extract::State;
        use axum::http::{Method, StatusCode, Uri};
        use axum::Router;
        use std::collections::HashMap;
        use std::sync::{Arc, Mutex};

        #[derive(Default)]
        pub struct Controller {
            routes: Mutex<HashMap<String, (u16, String)>>,
            requests: Mutex<Vec<(String, String)>>,
        }

        impl Controller {
            pub fn route(&self, key: &str, status: u16, body: &str) -> &Self {
                self.routes
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), (status, body.to_string()));
                self
            }

            /// `METHOD /path?query` and body of every request, in order
            pub fn requests(&self) -> Vec<(String, String)> {
                self.requests.lock().unwrap().clone()
            }
        }

        async fn handle(
            State(controller): State<Arc<Controller>>,
            method: Method,
            uri: Uri,
            body: Bytes,
        ) -> (StatusCode, String) {
            controller.requests.lock().unwrap().push((
                format!("{method} {uri}"),
                String::from_utf8_lossy(&body).to_string(),
            ));
            let key = format!("{method} {}", uri.path());
            let (status, body) = controller
                .routes
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or((404, String::new()));
            (StatusCode::from_u16(status).unwrap(), body)
        }

        /// Serve on an ephemeral port, returning the base URL
        pub async fn start() -> (String, Arc<Controller>) {
            let controller = Arc::new(Controller::default());
            let app = Router::new()
                .fallback(handle)
                .with_state(controller.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{addr}"), controller)
        }
    }

    const DEVICES: &str = r#"[{"id": "dev-1", "onboard": "x"}]"#;

    async fn source() -> (ControllerSource, Arc<stub::Controller>) {
        let (url, controller) = stub::start().await;
        let source = ControllerSource::new(url, 5).unwrap().serial("31415926");
        (source, controller)
    }

    #[tokio::test]
    async fn test_fetch_resolves_then_reads_config() {
        let (source, controller) = source().await;
        controller
            .route("GET /api/v1/devices", 200, DEVICES)
            .route(
                "GET /api/v1/devices/dev-1/config",
                200,
                r#"{"version": 4, "payload": {"api_v1": true}}"#,
            );
        let identity = DeviceIdentity::generate("ZedVirtual-4G");

        let doc = source.fetch(&identity).await.unwrap();
        assert_eq!(doc.version, 4);
        assert_eq!(doc.get("api_v1"), Some(&serde_json::json!(true)));

        let requests: Vec<String> = controller.requests().into_iter().map(|(r, _)| r).collect();
        assert_eq!(
            requests,
            vec![
                format!("GET /api/v1/devices?onboard={}", identity.onboard_id),
                "GET /api/v1/devices/dev-1/config".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_commit_posts_document_to_sync_endpoint() {
        let (source, controller) = source().await;
        controller
            .route("GET /api/v1/devices", 200, DEVICES)
            .route("POST /api/v1/devices/dev-1/config/sync", 200, "");
        let mut doc = ConfigDocument::new().with_version(6);
        doc.set("server", "mydomain.adam:3333");

        source
            .commit(&DeviceIdentity::generate("ZedVirtual-4G"), &doc)
            .await
            .unwrap();

        let (request, body) = controller.requests().pop().unwrap();
        assert_eq!(request, "POST /api/v1/devices/dev-1/config/sync");
        let sent: ConfigDocument = serde_json::from_str(&body).unwrap();
        assert_eq!(sent, doc);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let (source, controller) = source().await;
        controller.route("GET /api/v1/devices", 200, "[]");

        let err = source
            .fetch(&DeviceIdentity::generate("ZedVirtual-4G"))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_errors_mid_flow_are_classified() {
        let (source, controller) = source().await;
        controller.route("GET /api/v1/devices", 200, DEVICES);
        let identity = DeviceIdentity::generate("ZedVirtual-4G");

        for (status, retryable) in [(503, true), (429, true), (500, true), (400, false), (403, false)] {
            controller.route("GET /api/v1/devices/dev-1/config", status, "nope");
            let err = source.fetch(&identity).await.unwrap_err();
            assert_eq!(err.is_retryable(), retryable, "{status}: {err}");
            if !retryable {
                assert!(matches!(err, ConfigError::Permanent(_)), "{status}: {err}");
            }
        }

        controller.route("POST /api/v1/devices/dev-1/config/sync", 502, "bad gateway");
        let err = source
            .commit(&identity, &ConfigDocument::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unregister_tolerates_missing_records() {
        let (source, controller) = source().await;
        let identity = DeviceIdentity::generate("ZedVirtual-4G");
        controller.route("GET /api/v1/devices", 200, DEVICES);

        // both DELETEs answer 404 (unrouted)
        source.unregister(&identity).await.unwrap();
        let requests: Vec<String> = controller.requests().into_iter().map(|(r, _)| r).collect();
        assert!(requests.contains(&"DELETE /api/v1/devices/dev-1".to_string()));
        assert!(requests.contains(&format!("DELETE /api/v1/onboard/{}", identity.onboard_id)));

        controller.route("GET /api/v1/devices", 200, "[]");
        source.unregister(&identity).await.unwrap();

        controller.route(
            &format!("DELETE /api/v1/onboard/{}", identity.onboard_id),
            500,
            "boom",
        );
        assert!(source.unregister(&identity).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_register_twice_accepts_conflict() {
        let (source, controller) = source().await;
        let identity = DeviceIdentity::generate("ZedVirtual-4G");

        controller.route("POST /api/v1/onboard", 201, "");
        source.register(&identity, "CERT").await.unwrap();
        let (_, body) = controller.requests().pop().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(sent["onboard_id"], identity.onboard_id.to_string());
        assert_eq!(sent["serial"], "31415926");
        assert_eq!(sent["cert"], "CERT");

        controller.route("POST /api/v1/onboard", 409, "already onboarded");
        source.register(&identity, "CERT").await.unwrap();

        controller.route("POST /api/v1/onboard", 422, "bad cert");
        let err = source.register(&identity, "CERT").await.unwrap_err();
        assert!(matches!(err, ConfigError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_retryable() {
        // bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let source = ControllerSource::new(format!("http://127.0.0.1:{port}"), 2).unwrap();
        let identity = DeviceIdentity::generate("ZedVirtual-4G");

        let err = source.fetch(&identity).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
