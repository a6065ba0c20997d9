//! Gist-style adapter: OAuth device flow, one private gist holding one file
//! with a fixed well-known name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::SyncError;
use crate::http::{HttpClient, HttpRequest};
use crate::providers::oauth::{self, poll_device_token};
use crate::providers::{status_error, transport_error, AuthEvidence, AuthStart, CloudAdapter};
use crate::types::{AccountInfo, OAuthTokens, Provider};
use skyvault_envelope::SyncedFile;

/// Well-known file name inside the container gist. Stable across versions.
pub const CONTAINER_FILE: &str = "skyvault.sync.json";

/// Placeholder content written when the container is first created.
const EMPTY_CONTENT: &str = "{}";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct GistConfig {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub api_base: String,
    pub device_code_url: String,
    pub token_url: String,
}

impl Default for GistConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            scopes: vec!["gist".into()],
            api_base: "https://api.github.com".into(),
            device_code_url: "https://github.com/login/device/code".into(),
            token_url: "https://github.com/login/oauth/access_token".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    /// Seconds until the device code expires.
    expires_in: i64,
    /// Polling cadence in seconds.
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct GistFileEntry {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: Option<bool>,
    #[serde(default)]
    raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GistRecord {
    id: String,
    #[serde(default)]
    files: HashMap<String, GistFileEntry>,
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    login: String,
    id: i64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct GistAdapter {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    config: GistConfig,
    tokens: Mutex<Option<OAuthTokens>>,
    gist_id: Mutex<Option<String>>,
}

impl GistAdapter {
    pub fn new(http: Arc<dyn HttpClient>, clock: Arc<dyn Clock>, config: GistConfig) -> Self {
        Self {
            http,
            clock,
            config,
            tokens: Mutex::new(None),
            gist_id: Mutex::new(None),
        }
    }

    /// Access token for the next request, refreshed ahead of expiry.
    async fn bearer(&self) -> Result<String, SyncError> {
        let current = self
            .tokens()
            .ok_or(SyncError::ProviderNotConnected(Provider::Gist))?;
        if let Some(fresh) = oauth::ensure_fresh(
            self.http.as_ref(),
            self.clock.as_ref(),
            Provider::Gist,
            &self.config.token_url,
            &self.config.client_id,
            None,
            &current,
        )
        .await?
        {
            let access = fresh.access_token.clone();
            *self.tokens.lock().unwrap() = Some(fresh);
            return Ok(access);
        }
        Ok(current.access_token)
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    async fn execute(&self, request: HttpRequest) -> Result<crate::http::HttpResponse, SyncError> {
        let token = self.bearer().await?;
        self.http
            .execute(
                request
                    .bearer(&token)
                    .header("Accept", "application/vnd.github+json"),
            )
            .await
            .map_err(|e| transport_error(Provider::Gist, e))
    }

    fn required_gist_id(&self) -> Result<String, SyncError> {
        self.gist_id
            .lock()
            .unwrap()
            .clone()
            .ok_or(SyncError::NotFound(Provider::Gist))
    }

    /// Fetch the container file's content, following the raw URL when the
    /// inline copy was truncated by the API.
    async fn file_content(&self, entry: &GistFileEntry) -> Result<Option<String>, SyncError> {
        if entry.truncated == Some(true) {
            if let Some(raw_url) = &entry.raw_url {
                let response = self.execute(HttpRequest::get(raw_url)).await?;
                if !response.is_success() {
                    return Err(status_error(Provider::Gist, &response));
                }
                return Ok(Some(response.text()));
            }
        }
        Ok(entry.content.clone())
    }
}

#[async_trait]
impl CloudAdapter for GistAdapter {
    fn provider(&self) -> Provider {
        Provider::Gist
    }

    async fn start_auth(&self, _redirect_uri: Option<String>) -> Result<AuthStart, SyncError> {
        let scope = self.config.scopes.join(" ");
        let request = HttpRequest::post(&self.config.device_code_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("scope", scope.as_str()),
            ]);
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| transport_error(Provider::Gist, e))?;
        if !response.is_success() {
            return Err(status_error(Provider::Gist, &response));
        }
        let parsed: DeviceCodeResponse =
            response.json().map_err(|e| SyncError::ProviderBadRequest {
                provider: Provider::Gist,
                detail: format!("device code response: {}", e),
            })?;

        Ok(AuthStart::DeviceCode {
            user_code: parsed.user_code,
            verification_uri: parsed.verification_uri,
            interval_secs: parsed.interval,
            expires_at: self.clock.now_ms() + parsed.expires_in * 1_000,
            device_code: parsed.device_code,
        })
    }

    async fn complete_auth(
        &self,
        evidence: AuthEvidence,
    ) -> Result<(OAuthTokens, Option<AccountInfo>), SyncError> {
        let AuthEvidence::DeviceCode { device_code, interval_secs, expires_at } = evidence else {
            return Err(SyncError::ProviderBadRequest {
                provider: Provider::Gist,
                detail: "expected device-code evidence".into(),
            });
        };

        let tokens = poll_device_token(
            self.http.as_ref(),
            self.clock.as_ref(),
            Provider::Gist,
            &self.config.token_url,
            &self.config.client_id,
            &device_code,
            interval_secs,
            expires_at,
        )
        .await?;
        *self.tokens.lock().unwrap() = Some(tokens.clone());

        // Cache who we are; failure here should not undo a successful auth.
        let account = match self.execute(HttpRequest::get(self.api("/user"))).await {
            Ok(response) if response.is_success() => {
                response.json::<UserRecord>().ok().map(|user| AccountInfo {
                    login: Some(user.login),
                    id: Some(user.id.to_string()),
                    email: None,
                })
            }
            _ => None,
        };

        info!(login = ?account.as_ref().and_then(|a| a.login.clone()), "gist auth completed");
        Ok((tokens, account))
    }

    async fn initialize_sync(&self) -> Result<Option<String>, SyncError> {
        let response = self
            .execute(HttpRequest::get(self.api("/gists?per_page=100")))
            .await?;
        if !response.is_success() {
            return Err(status_error(Provider::Gist, &response));
        }
        let gists: Vec<GistRecord> =
            response.json().map_err(|e| SyncError::ProviderBadRequest {
                provider: Provider::Gist,
                detail: format!("gist list: {}", e),
            })?;

        if let Some(existing) = gists.iter().find(|g| g.files.contains_key(CONTAINER_FILE)) {
            debug!(gist_id = %existing.id, "found existing container gist");
            *self.gist_id.lock().unwrap() = Some(existing.id.clone());
            return Ok(Some(existing.id.clone()));
        }

        let body = json!({
            "description": "Skyvault encrypted sync container",
            "public": false,
            "files": { CONTAINER_FILE: { "content": EMPTY_CONTENT } }
        });
        let response = self
            .execute(HttpRequest::post(self.api("/gists")).json(&body))
            .await?;
        if !response.is_success() {
            return Err(status_error(Provider::Gist, &response));
        }
        let created: GistRecord = response.json().map_err(|e| SyncError::ProviderBadRequest {
            provider: Provider::Gist,
            detail: format!("gist create: {}", e),
        })?;
        info!(gist_id = %created.id, "created container gist");
        *self.gist_id.lock().unwrap() = Some(created.id.clone());
        Ok(Some(created.id))
    }

    async fn upload(&self, file: &SyncedFile) -> Result<(), SyncError> {
        let gist_id = self.required_gist_id()?;
        let body = json!({
            "files": { CONTAINER_FILE: { "content": file.to_json() } }
        });
        let response = self
            .execute(HttpRequest::patch(self.api(&format!("/gists/{}", gist_id))).json(&body))
            .await?;
        if !response.is_success() {
            return Err(status_error(Provider::Gist, &response));
        }
        Ok(())
    }

    async fn download(&self) -> Result<Option<SyncedFile>, SyncError> {
        let gist_id = self.required_gist_id()?;
        let response = self
            .execute(HttpRequest::get(self.api(&format!("/gists/{}", gist_id))))
            .await?;
        if !response.is_success() {
            return Err(status_error(Provider::Gist, &response));
        }
        let record: GistRecord = response.json().map_err(|e| SyncError::ProviderBadRequest {
            provider: Provider::Gist,
            detail: format!("gist fetch: {}", e),
        })?;

        let Some(entry) = record.files.get(CONTAINER_FILE) else {
            return Ok(None);
        };
        let Some(content) = self.file_content(entry).await? else {
            return Ok(None);
        };
        if content.trim().is_empty() || content == EMPTY_CONTENT {
            return Ok(None);
        }
        let file = SyncedFile::from_json(&content)?;
        Ok(Some(file))
    }

    async fn sign_out(&self) -> Result<(), SyncError> {
        // Device-flow apps hold no client secret, so there is no revocation
        // endpoint to call; dropping the token locally is the whole story.
        *self.tokens.lock().unwrap() = None;
        *self.gist_id.lock().unwrap() = None;
        Ok(())
    }

    fn tokens(&self) -> Option<OAuthTokens> {
        self.tokens.lock().unwrap().clone()
    }

    fn set_session(&self, tokens: Option<OAuthTokens>, resource_id: Option<String>) {
        *self.tokens.lock().unwrap() = tokens;
        *self.gist_id.lock().unwrap() = resource_id;
    }

    fn resource_id(&self) -> Option<String> {
        self.gist_id.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::mock::{json_response, MockHttpClient};
    use crate::http::Method;
    use skyvault_envelope::{encrypt_payload_with, DeviceIdentity, MIN_ITERATIONS};

    fn adapter() -> (Arc<MockHttpClient>, GistAdapter) {
        let http = Arc::new(MockHttpClient::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = GistConfig {
            client_id: "cid".into(),
            ..GistConfig::default()
        };
        let adapter = GistAdapter::new(http.clone(), clock, config);
        adapter.set_session(
            Some(OAuthTokens {
                access_token: "tok".into(),
                refresh_token: None,
                expires_at: None,
                token_type: "bearer".into(),
                scope: Some("gist".into()),
            }),
            None,
        );
        (http, adapter)
    }

    fn sample_file() -> SyncedFile {
        let device = DeviceIdentity {
            id: "d".into(),
            name: "n".into(),
            app_version: "1".into(),
        };
        encrypt_payload_with(
            &serde_json::json!({"syncedAt": 1i64}),
            "pw",
            MIN_ITERATIONS,
            &device,
            0,
            1_000,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_auth_returns_device_code_record() {
        let (http, adapter) = adapter();
        http.expect_json(
            Method::Post,
            "login/device/code",
            200,
            serde_json::json!({
                "device_code": "dc-1",
                "user_code": "ABCD-1234",
                "verification_uri": "https://github.com/login/device",
                "expires_in": 900,
                "interval": 5
            }),
        );

        let start = adapter.start_auth(None).await.unwrap();
        match start {
            AuthStart::DeviceCode { user_code, interval_secs, expires_at, device_code, .. } => {
                assert_eq!(user_code, "ABCD-1234");
                assert_eq!(interval_secs, 5);
                assert_eq!(expires_at, 1_000_000 + 900_000);
                assert_eq!(device_code, "dc-1");
            }
            other => panic!("expected device code start, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn initialize_sync_finds_existing_container() {
        let (http, adapter) = adapter();
        http.expect_json(
            Method::Get,
            "/gists?per_page=100",
            200,
            serde_json::json!([
                { "id": "other", "files": { "notes.md": {} } },
                { "id": "g-42", "files": { CONTAINER_FILE: {} } }
            ]),
        );

        let id = adapter.initialize_sync().await.unwrap();
        assert_eq!(id.as_deref(), Some("g-42"));
        assert_eq!(adapter.resource_id().as_deref(), Some("g-42"));
        assert_eq!(http.request_count(Method::Post, "/gists"), 0);
    }

    #[tokio::test]
    async fn initialize_sync_creates_container_when_missing() {
        let (http, adapter) = adapter();
        http.expect_json(Method::Get, "/gists?per_page=100", 200, serde_json::json!([]));
        http.expect_json(
            Method::Post,
            "/gists",
            201,
            serde_json::json!({ "id": "g-new", "files": { CONTAINER_FILE: {} } }),
        );

        let id = adapter.initialize_sync().await.unwrap();
        assert_eq!(id.as_deref(), Some("g-new"));

        let create = http
            .requests()
            .into_iter()
            .find(|r| r.method == Method::Post)
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(create.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["public"], false);
        assert!(body["files"][CONTAINER_FILE].is_object());
    }

    #[tokio::test]
    async fn upload_patches_the_container_gist() {
        let (http, adapter) = adapter();
        adapter.set_session(adapter.tokens(), Some("g-42".into()));
        http.expect_json(Method::Patch, "/gists/g-42", 200, serde_json::json!({}));

        adapter.upload(&sample_file()).await.unwrap();
        assert_eq!(http.request_count(Method::Patch, "/gists/g-42"), 1);
    }

    #[tokio::test]
    async fn upload_maps_missing_gist_to_not_found() {
        let (http, adapter) = adapter();
        adapter.set_session(adapter.tokens(), Some("g-gone".into()));
        http.expect(
            Method::Patch,
            "/gists/g-gone",
            Ok(json_response(404, serde_json::json!({"message": "Not Found"}))),
        );

        let err = adapter.upload(&sample_file()).await.unwrap_err();
        assert_eq!(err, SyncError::NotFound(Provider::Gist));
    }

    #[tokio::test]
    async fn revoked_token_maps_to_reauth_required() {
        let (http, adapter) = adapter();
        adapter.set_session(adapter.tokens(), Some("g-42".into()));
        http.expect(
            Method::Get,
            "/gists/g-42",
            Ok(json_response(401, serde_json::json!({"message": "Bad credentials"}))),
        );

        let err = adapter.download().await.unwrap_err();
        assert_eq!(err, SyncError::ReauthRequired(Provider::Gist));
    }

    #[tokio::test]
    async fn download_parses_container_content() {
        let (http, adapter) = adapter();
        adapter.set_session(adapter.tokens(), Some("g-42".into()));
        let file = sample_file();
        http.expect_json(
            Method::Get,
            "/gists/g-42",
            200,
            serde_json::json!({
                "id": "g-42",
                "files": { CONTAINER_FILE: { "content": file.to_json() } }
            }),
        );

        let downloaded = adapter.download().await.unwrap().unwrap();
        assert_eq!(downloaded, file);
    }

    #[tokio::test]
    async fn download_of_placeholder_content_is_absent() {
        let (http, adapter) = adapter();
        adapter.set_session(adapter.tokens(), Some("g-42".into()));
        http.expect_json(
            Method::Get,
            "/gists/g-42",
            200,
            serde_json::json!({
                "id": "g-42",
                "files": { CONTAINER_FILE: { "content": "{}" } }
            }),
        );
        assert_eq!(adapter.download().await.unwrap(), None);
    }

    #[tokio::test]
    async fn download_follows_truncated_raw_url() {
        let (http, adapter) = adapter();
        adapter.set_session(adapter.tokens(), Some("g-42".into()));
        let file = sample_file();
        http.expect_json(
            Method::Get,
            "/gists/g-42",
            200,
            serde_json::json!({
                "id": "g-42",
                "files": { CONTAINER_FILE: {
                    "content": "{\"meta\"",
                    "truncated": true,
                    "raw_url": "https://gist.example.test/raw/g-42"
                } }
            }),
        );
        http.expect(
            Method::Get,
            "/raw/g-42",
            Ok(crate::http::HttpResponse {
                status: 200,
                headers: vec![],
                body: file.to_json().into_bytes(),
            }),
        );

        let downloaded = adapter.download().await.unwrap().unwrap();
        assert_eq!(downloaded, file);
    }

    #[tokio::test]
    async fn sign_out_drops_tokens() {
        let (_http, adapter) = adapter();
        adapter.sign_out().await.unwrap();
        assert!(adapter.tokens().is_none());
        assert!(adapter.resource_id().is_none());
    }
}
