pub mod models;
pub mod session;
pub mod sign;

use std::{future::Future, sync::Arc};

use anyhow::Context;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Method,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{AuthError, DeviceError},
};

use self::{
    models::{
        Command, DeviceProperty, DeviceStatusResponse, SendCommandRequest, SendCommandResponse,
        TokenResponse, TuyaResponse,
    },
    session::{IssuedToken, TokenSession},
    sign::{signed_headers, SigningContext},
};

/// How many times a call is repeated after the API reports an expired token.
const MAX_REAUTH_RETRIES: u32 = 1;

#[derive(Debug, Clone)]
pub struct TuyaClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    session: TokenSession,
}

/// Failure below the envelope: the HTTP exchange itself or the JSON body.
#[derive(Debug)]
enum RequestError {
    Transport(reqwest::Error),
    Decode(String),
}

impl From<RequestError> for AuthError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Transport(e) => AuthError::Transport(e),
            RequestError::Decode(msg) => AuthError::Decode(msg),
        }
    }
}

impl From<RequestError> for DeviceError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Transport(e) => DeviceError::Transport(e),
            RequestError::Decode(msg) => DeviceError::Decode(msg),
        }
    }
}

impl TuyaClient {
    /// Every request made through this client is bounded by the configured
    /// call timeout.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.call_timeout())
            .build()
            .context("Failed to build Tuya HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: config.tuya_base_url.clone(),
                client_id: config.tuya_client_id.clone(),
                client_secret: config.tuya_client_secret.clone(),
                session: TokenSession::new(),
            }),
        })
    }

    /// Returns a valid access token, exchanging credentials if necessary.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        self.inner.session.ensure_token(|| self.fetch_token()).await
    }

    /// Forgets the current token; the next call re-authenticates.
    pub async fn invalidate_token(&self) {
        self.inner.session.invalidate().await;
    }

    async fn fetch_token(&self) -> Result<IssuedToken, AuthError> {
        info!("Fetching new Tuya access token");
        let resp: TokenResponse = self
            .request(Method::GET, "/v1.0/token?grant_type=1", None, None)
            .await?;

        let token = resp.into_result().map_err(|failure| match failure {
            Some(f) => AuthError::Rejected { code: f.code, msg: f.msg },
            None => AuthError::Decode("token response has no result".to_owned()),
        })?;

        Ok(IssuedToken {
            access_token: token.access_token,
            expire_time: token.expire_time,
        })
    }

    /// Fetch all data-point (DP) properties for a device.
    pub async fn get_device_status(&self, device_id: &str) -> Result<Vec<DeviceProperty>, DeviceError> {
        let path = format!("/v1.0/devices/{device_id}/status");
        debug!(device_id = %device_id, "Fetching device status");

        self.with_reauth(|token| {
            let path = path.as_str();
            async move {
                let resp: DeviceStatusResponse =
                    self.request(Method::GET, path, None, Some(token.as_str())).await?;
                resp.into_device_result("device status")
            }
        })
        .await
    }

    /// Send one or more commands to a device.
    pub async fn send_commands(&self, device_id: &str, commands: Vec<Command>) -> Result<bool, DeviceError> {
        let path = format!("/v1.0/devices/{device_id}/commands");
        let body = serde_json::to_vec(&SendCommandRequest { commands })
            .map_err(|e| DeviceError::Decode(format!("cannot serialize command body: {e}")))?;
        debug!(device_id = %device_id, "Sending commands to device");

        self.with_reauth(|token| {
            let (path, body) = (path.as_str(), body.as_slice());
            async move {
                let resp: SendCommandResponse =
                    self.request(Method::POST, path, Some(body), Some(token.as_str())).await?;
                resp.into_device_result("send commands")
            }
        })
        .await
    }

    /// Runs `op` with a valid token. When the API answers with the
    /// token-expired code, the token is dropped and `op` runs again, at most
    /// [`MAX_REAUTH_RETRIES`] times; a further expiry is returned as is.
    async fn with_reauth<T, F, Fut>(&self, mut op: F) -> Result<T, DeviceError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let mut retries = 0;
        loop {
            let token = self.access_token().await?;
            match op(token).await {
                Err(e) if e.is_token_expired() && retries < MAX_REAUTH_RETRIES => {
                    retries += 1;
                    warn!("Tuya reported an expired token; re-authenticating");
                    self.invalidate_token().await;
                }
                other => return other,
            }
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&[u8]>,
        access_token: Option<&str>,
    ) -> Result<TuyaResponse<T>, RequestError> {
        let url = format!("{}{}", self.inner.base_url, path_and_query);
        let t = chrono::Utc::now().timestamp_millis().to_string();
        let ctx = SigningContext {
            method: method.as_str(),
            path_and_query,
            body_bytes: body.unwrap_or_default(),
            access_token,
            t: &t,
        };
        let headers = to_header_map(signed_headers(
            &self.inner.client_id,
            &self.inner.client_secret,
            &ctx,
        ))?;

        let mut req = self.inner.http.request(method, &url).headers(headers);
        if let Some(body) = body {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        let bytes = req
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(RequestError::Transport)?
            .bytes()
            .await
            .map_err(RequestError::Transport)?;

        serde_json::from_slice(&bytes)
            .map_err(|e| RequestError::Decode(format!("{path_and_query}: {e}")))
    }
}

/// Convert our string `HashMap` into a `reqwest::header::HeaderMap`.
fn to_header_map(
    map: std::collections::HashMap<String, String>,
) -> Result<HeaderMap, RequestError> {
    let mut header_map = HeaderMap::new();
    for (k, v) in map {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| RequestError::Decode(format!("invalid header name: {k}")))?;
        let value = HeaderValue::from_str(&v)
            .map_err(|_| RequestError::Decode(format!("invalid header value for {k}")))?;
        header_map.insert(name, value);
    }
    Ok(header_map)
}

// ---------------------------------------------------------------------------
// Tests
//
// A throwaway axum server stands in for the Tuya cloud so the real client
// (signing, envelope handling, reauth) runs end to end over HTTP.
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use axum::{
        extract::State,
        http::HeaderMap as AxumHeaders,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;

    pub(crate) fn test_config(base_url: &str) -> Config {
        Config {
            database_url: "postgres://unused".into(),
            tuya_client_id: "client-id".into(),
            tuya_client_secret: "client-secret".into(),
            tuya_base_url: base_url.to_owned(),
            tuya_device_id: "plug1".into(),
            server_host: "127.0.0.1".into(),
            server_port: 0,
            poll_interval_secs: 30,
            call_timeout_secs: 5,
        }
    }

    #[derive(Default)]
    struct FakeTuya {
        token_calls: AtomicUsize,
        status_calls: AtomicUsize,
        /// Scripted status bodies; when empty a healthy reading is returned.
        status_script: Mutex<VecDeque<Value>>,
        commands: Mutex<Vec<Value>>,
        tokens_seen: Mutex<Vec<String>>,
    }

    fn expired() -> Value {
        json!({"success": false, "t": 1, "code": 1010, "msg": "token invalid"})
    }

    fn healthy_status() -> Value {
        json!({"success": true, "t": 1, "result": [
            {"code": "switch_1", "value": true},
            {"code": "cur_voltage", "value": 2345},
            {"code": "cur_current", "value": 120},
            {"code": "cur_power", "value": 300}
        ]})
    }

    fn header(h: &AxumHeaders, name: &str) -> String {
        h.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default().to_owned()
    }

    async fn token(State(fake): State<Arc<FakeTuya>>, h: AxumHeaders) -> Json<Value> {
        assert_eq!(header(&h, "client_id"), "client-id");
        assert_eq!(header(&h, "sign").len(), 64);
        assert!(h.get("access_token").is_none());
        let n = fake.token_calls.fetch_add(1, Ordering::SeqCst);
        Json(json!({"success": true, "t": 1, "result": {
            "access_token": format!("tok-{n}"), "expire_time": 7200,
            "refresh_token": "r", "uid": "u"
        }}))
    }

    async fn status(State(fake): State<Arc<FakeTuya>>, h: AxumHeaders) -> Json<Value> {
        fake.status_calls.fetch_add(1, Ordering::SeqCst);
        fake.tokens_seen.lock().unwrap().push(header(&h, "access_token"));
        let next = fake.status_script.lock().unwrap().pop_front();
        Json(next.unwrap_or_else(healthy_status))
    }

    async fn commands(State(fake): State<Arc<FakeTuya>>, Json(body): Json<Value>) -> Json<Value> {
        fake.commands.lock().unwrap().push(body);
        Json(json!({"success": true, "t": 1, "result": true}))
    }

    async fn spawn_fake(fake: Arc<FakeTuya>) -> TuyaClient {
        let app = Router::new()
            .route("/v1.0/token", get(token))
            .route("/v1.0/devices/{id}/status", get(status))
            .route("/v1.0/devices/{id}/commands", post(commands))
            .with_state(fake);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        TuyaClient::new(&test_config(&format!("http://{addr}"))).unwrap()
    }

    #[tokio::test]
    async fn status_fetch_authenticates_once_and_reuses_token() {
        let fake = Arc::new(FakeTuya::default());
        let client = spawn_fake(fake.clone()).await;

        client.get_device_status("plug1").await.unwrap();
        client.get_device_status("plug1").await.unwrap();

        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*fake.tokens_seen.lock().unwrap(), vec!["tok-0", "tok-0"]);
    }

    #[tokio::test]
    async fn single_expiry_is_recovered_silently() {
        let fake = Arc::new(FakeTuya::default());
        fake.status_script.lock().unwrap().push_back(expired());
        let client = spawn_fake(fake.clone()).await;

        let dps = client.get_device_status("plug1").await.unwrap();

        assert!(dps.iter().any(|dp| dp.code == "switch_1"));
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fake.status_calls.load(Ordering::SeqCst), 2);
        assert_eq!(*fake.tokens_seen.lock().unwrap(), vec!["tok-0", "tok-1"]);
    }

    #[tokio::test]
    async fn repeated_expiry_surfaces_device_error() {
        let fake = Arc::new(FakeTuya::default());
        fake.status_script.lock().unwrap().extend([expired(), expired()]);
        let client = spawn_fake(fake.clone()).await;

        let err = client.get_device_status("plug1").await.unwrap_err();

        assert!(err.is_token_expired());
        assert_eq!(fake.status_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_api_errors_are_not_retried() {
        let fake = Arc::new(FakeTuya::default());
        fake.status_script
            .lock()
            .unwrap()
            .push_back(json!({"success": false, "t": 1, "code": 1106, "msg": "permission deny"}));
        let client = spawn_fake(fake.clone()).await;

        let err = client.get_device_status("plug1").await.unwrap_err();

        assert!(matches!(err, DeviceError::Api { code: 1106, .. }));
        assert_eq!(fake.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_commands_posts_switch_body() {
        let fake = Arc::new(FakeTuya::default());
        let client = spawn_fake(fake.clone()).await;

        let ok = client.send_commands("plug1", vec![Command::switch(false)]).await.unwrap();

        assert!(ok);
        assert_eq!(
            fake.commands.lock().unwrap()[0],
            json!({"commands": [{"code": "switch_1", "value": false}]})
        );
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = TuyaClient::new(&test_config(&format!("http://{addr}"))).unwrap();

        let err = client.get_device_status("plug1").await.unwrap_err();
        assert!(matches!(err, DeviceError::Auth(AuthError::Transport(_))));
    }

    #[test]
    fn to_header_map_converts_correctly() {
        let mut map = std::collections::HashMap::new();
        map.insert("client_id".to_owned(), "abc".to_owned());
        map.insert("sign".to_owned(), "DEF123".to_owned());

        let hm = to_header_map(map).expect("should convert");
        assert_eq!(hm["client_id"], "abc");
        assert_eq!(hm["sign"], "DEF123");
    }
}
