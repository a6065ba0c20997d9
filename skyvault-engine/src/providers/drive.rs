//! Drive-style adapters: PKCE auth, one file with a well-known name inside
//! the provider's app-scoped folder.
//!
//! Both drive providers share one adapter; they differ only in endpoints,
//! scopes, and how the container file is addressed (name query vs. path).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::SyncError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::providers::oauth::{self, PkceChallenge};
use crate::providers::{status_error, transport_error, AuthEvidence, AuthStart, CloudAdapter};
use crate::types::{AccountInfo, OAuthTokens, Provider};
use skyvault_envelope::SyncedFile;

/// Well-known container file name. Stable across versions.
pub const CONTAINER_FILE: &str = "skyvault.sync.json";

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// How the provider addresses a file in its app folder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveApiStyle {
    /// Query the file list by name (`?q=name='...'` within the app space).
    QueryByName,
    /// Address the file by path relative to the app root.
    PathByName,
}

#[derive(Clone, Debug)]
pub struct DriveEndpoints {
    pub style: DriveApiStyle,
    pub auth_url: String,
    pub token_url: String,
    /// Metadata/list base.
    pub files_base: String,
    /// Content upload base (query-style providers separate the two).
    pub upload_base: String,
    /// Identity probe for caching the account label. Optional.
    pub about_url: Option<String>,
    /// Best-effort token revocation endpoint. Optional.
    pub revoke_url: Option<String>,
    /// Extra query parameters on the authorization URL.
    pub extra_auth_params: Vec<(String, String)>,
}

impl DriveEndpoints {
    /// First drive provider: query-by-name app-data folder API.
    pub fn drive_a() -> Self {
        Self {
            style: DriveApiStyle::QueryByName,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            files_base: "https://www.googleapis.com/drive/v3/files".into(),
            upload_base: "https://www.googleapis.com/upload/drive/v3/files".into(),
            about_url: Some("https://www.googleapis.com/drive/v3/about?fields=user".into()),
            revoke_url: Some("https://oauth2.googleapis.com/revoke".into()),
            extra_auth_params: vec![
                ("access_type".into(), "offline".into()),
                ("prompt".into(), "consent".into()),
            ],
        }
    }

    /// Second drive provider: path-addressed app root.
    pub fn drive_b() -> Self {
        Self {
            style: DriveApiStyle::PathByName,
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize".into(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".into(),
            files_base: "https://graph.microsoft.com/v1.0/me/drive".into(),
            upload_base: "https://graph.microsoft.com/v1.0/me/drive".into(),
            about_url: Some("https://graph.microsoft.com/v1.0/me".into()),
            revoke_url: None,
            extra_auth_params: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DriveConfig {
    pub provider: Provider,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub endpoints: DriveEndpoints,
}

impl DriveConfig {
    pub fn drive_a() -> Self {
        Self {
            provider: Provider::DriveA,
            client_id: String::new(),
            client_secret: None,
            scopes: vec!["https://www.googleapis.com/auth/drive.appdata".into()],
            endpoints: DriveEndpoints::drive_a(),
        }
    }

    pub fn drive_b() -> Self {
        Self {
            provider: Provider::DriveB,
            client_id: String::new(),
            client_secret: None,
            scopes: vec![
                "Files.ReadWrite.AppFolder".into(),
                "offline_access".into(),
                "User.Read".into(),
            ],
            endpoints: DriveEndpoints::drive_b(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FileStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    #[serde(default)]
    files: Vec<FileStub>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

struct PendingAuth {
    pkce: PkceChallenge,
    redirect_uri: String,
}

pub struct DriveAdapter {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    config: DriveConfig,
    tokens: Mutex<Option<OAuthTokens>>,
    file_id: Mutex<Option<String>>,
    pending: Mutex<Option<PendingAuth>>,
}

impl DriveAdapter {
    pub fn new(http: Arc<dyn HttpClient>, clock: Arc<dyn Clock>, config: DriveConfig) -> Self {
        Self {
            http,
            clock,
            config,
            tokens: Mutex::new(None),
            file_id: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    fn provider_kind(&self) -> Provider {
        self.config.provider
    }

    /// Access token for the next request, refreshed ahead of expiry. A
    /// refreshed set replaces the adapter's copy so the orchestrator can
    /// persist it afterwards.
    async fn bearer(&self) -> Result<String, SyncError> {
        let provider = self.provider_kind();
        let current = self
            .tokens()
            .ok_or(SyncError::ProviderNotConnected(provider))?;
        if let Some(fresh) = oauth::ensure_fresh(
            self.http.as_ref(),
            self.clock.as_ref(),
            provider,
            &self.config.endpoints.token_url,
            &self.config.client_id,
            self.config.client_secret.as_deref(),
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

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, SyncError> {
        let token = self.bearer().await?;
        self.http
            .execute(request.bearer(&token))
            .await
            .map_err(|e| transport_error(self.provider_kind(), e))
    }

    fn required_file_id(&self) -> Result<String, SyncError> {
        self.file_id
            .lock()
            .unwrap()
            .clone()
            .ok_or(SyncError::NotFound(self.provider_kind()))
    }

    fn parse_error(&self, context: &str, e: impl std::fmt::Display) -> SyncError {
        SyncError::ProviderBadRequest {
            provider: self.provider_kind(),
            detail: format!("{}: {}", context, e),
        }
    }

    // -- container addressing ------------------------------------------------

    async fn locate_file(&self) -> Result<Option<String>, SyncError> {
        let endpoints = &self.config.endpoints;
        match endpoints.style {
            DriveApiStyle::QueryByName => {
                let by_name = format!("name='{}'", CONTAINER_FILE);
                let url = url::Url::parse_with_params(
                    &endpoints.files_base,
                    &[
                        ("spaces", "appDataFolder"),
                        ("q", by_name.as_str()),
                        ("fields", "files(id,name)"),
                    ],
                )
                .map_err(|e| self.parse_error("files url", e))?;
                let response = self.execute(HttpRequest::get(url)).await?;
                if !response.is_success() {
                    return Err(status_error(self.provider_kind(), &response));
                }
                let list: FileListResponse = response
                    .json()
                    .map_err(|e| self.parse_error("file list", e))?;
                Ok(list.files.into_iter().next().map(|f| f.id))
            }
            DriveApiStyle::PathByName => {
                let url = format!("{}/special/approot:/{}", endpoints.files_base, CONTAINER_FILE);
                let response = self.execute(HttpRequest::get(url)).await?;
                if response.status == 404 {
                    return Ok(None);
                }
                if !response.is_success() {
                    return Err(status_error(self.provider_kind(), &response));
                }
                let stub: FileStub = response
                    .json()
                    .map_err(|e| self.parse_error("file metadata", e))?;
                Ok(Some(stub.id))
            }
        }
    }

    async fn write_content(&self, content: String, file_id: Option<&str>) -> Result<String, SyncError> {
        let endpoints = &self.config.endpoints;
        match endpoints.style {
            DriveApiStyle::QueryByName => {
                let id = match file_id {
                    Some(id) => id.to_string(),
                    None => {
                        // Metadata first, then content: the simple-upload
                        // endpoint cannot set the parent folder.
                        let body = json!({
                            "name": CONTAINER_FILE,
                            "parents": ["appDataFolder"]
                        });
                        let response = self
                            .execute(HttpRequest::post(&endpoints.files_base).json(&body))
                            .await?;
                        if !response.is_success() {
                            return Err(status_error(self.provider_kind(), &response));
                        }
                        let stub: FileStub = response
                            .json()
                            .map_err(|e| self.parse_error("file create", e))?;
                        stub.id
                    }
                };
                let url = format!("{}/{}?uploadType=media", endpoints.upload_base, id);
                let response = self
                    .execute(HttpRequest::patch(url).raw_body("application/json", content.into_bytes()))
                    .await?;
                if !response.is_success() {
                    return Err(status_error(self.provider_kind(), &response));
                }
                Ok(id)
            }
            DriveApiStyle::PathByName => {
                let url = format!(
                    "{}/special/approot:/{}:/content",
                    endpoints.upload_base, CONTAINER_FILE
                );
                let response = self
                    .execute(HttpRequest::put(url).raw_body("application/json", content.into_bytes()))
                    .await?;
                if !response.is_success() {
                    return Err(status_error(self.provider_kind(), &response));
                }
                let stub: FileStub = response
                    .json()
                    .map_err(|e| self.parse_error("upload response", e))?;
                Ok(stub.id)
            }
        }
    }

    async fn read_content(&self) -> Result<Option<String>, SyncError> {
        let endpoints = &self.config.endpoints;
        let url = match endpoints.style {
            DriveApiStyle::QueryByName => {
                format!("{}/{}?alt=media", endpoints.files_base, self.required_file_id()?)
            }
            DriveApiStyle::PathByName => format!(
                "{}/special/approot:/{}:/content",
                endpoints.files_base, CONTAINER_FILE
            ),
        };
        let response = self.execute(HttpRequest::get(url)).await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(status_error(self.provider_kind(), &response));
        }
        Ok(Some(response.text()))
    }

    async fn fetch_account(&self) -> Option<AccountInfo> {
        let about_url = self.config.endpoints.about_url.clone()?;
        let response = self.execute(HttpRequest::get(about_url)).await.ok()?;
        if !response.is_success() {
            return None;
        }
        let value: serde_json::Value = response.json().ok()?;
        // The two providers shape this differently; pick out what exists.
        let user = value.get("user").unwrap_or(&value);
        let login = user
            .get("displayName")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let email = user
            .get("emailAddress")
            .or_else(|| user.get("userPrincipalName"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let id = user
            .get("permissionId")
            .or_else(|| user.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if login.is_none() && email.is_none() && id.is_none() {
            return None;
        }
        Some(AccountInfo { login, id, email })
    }
}

#[async_trait]
impl CloudAdapter for DriveAdapter {
    fn provider(&self) -> Provider {
        self.provider_kind()
    }

    async fn start_auth(&self, redirect_uri: Option<String>) -> Result<AuthStart, SyncError> {
        let provider = self.provider_kind();
        let redirect_uri = redirect_uri.ok_or_else(|| SyncError::ProviderBadRequest {
            provider,
            detail: "redirect_uri required for PKCE".into(),
        })?;

        let pkce = PkceChallenge::generate()?;
        let auth_url = {
            let extra: Vec<(&str, &str)> = self
                .config
                .endpoints
                .extra_auth_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            oauth::build_auth_url(
                &self.config.endpoints.auth_url,
                &self.config.client_id,
                &redirect_uri,
                &self.config.scopes,
                &pkce,
                &extra,
            )?
        };
        let state = pkce.state.clone();
        *self.pending.lock().unwrap() = Some(PendingAuth {
            pkce,
            redirect_uri: redirect_uri.clone(),
        });
        debug!(%provider, "pkce auth started");

        Ok(AuthStart::Pkce { auth_url, redirect_uri, state })
    }

    async fn complete_auth(
        &self,
        evidence: AuthEvidence,
    ) -> Result<(OAuthTokens, Option<AccountInfo>), SyncError> {
        let provider = self.provider_kind();
        let AuthEvidence::Pkce { code, state, redirect_uri } = evidence else {
            return Err(SyncError::ProviderBadRequest {
                provider,
                detail: "expected PKCE evidence".into(),
            });
        };

        let pending = self
            .pending
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SyncError::ProviderBadRequest {
                provider,
                detail: "no authorization in progress".into(),
            })?;
        if pending.pkce.state != state || pending.redirect_uri != redirect_uri {
            return Err(SyncError::ProviderBadRequest {
                provider,
                detail: "state mismatch".into(),
            });
        }

        let tokens = oauth::exchange_code(
            self.http.as_ref(),
            self.clock.as_ref(),
            provider,
            &self.config.endpoints.token_url,
            &self.config.client_id,
            self.config.client_secret.as_deref(),
            &code,
            &pending.pkce.verifier,
            &redirect_uri,
        )
        .await?;
        *self.tokens.lock().unwrap() = Some(tokens.clone());

        let account = self.fetch_account().await;
        info!(%provider, "pkce auth completed");
        Ok((tokens, account))
    }

    async fn initialize_sync(&self) -> Result<Option<String>, SyncError> {
        if let Some(id) = self.locate_file().await? {
            debug!(provider = %self.provider_kind(), "found existing container file");
            *self.file_id.lock().unwrap() = Some(id.clone());
            return Ok(Some(id));
        }
        let id = self.write_content("{}".into(), None).await?;
        info!(provider = %self.provider_kind(), "created container file");
        *self.file_id.lock().unwrap() = Some(id.clone());
        Ok(Some(id))
    }

    async fn upload(&self, file: &SyncedFile) -> Result<(), SyncError> {
        let file_id = self.required_file_id()?;
        let id = self.write_content(file.to_json(), Some(&file_id)).await?;
        *self.file_id.lock().unwrap() = Some(id);
        Ok(())
    }

    async fn download(&self) -> Result<Option<SyncedFile>, SyncError> {
        let Some(content) = self.read_content().await? else {
            return Ok(None);
        };
        if content.trim().is_empty() || content == "{}" {
            return Ok(None);
        }
        Ok(Some(SyncedFile::from_json(&content)?))
    }

    async fn sign_out(&self) -> Result<(), SyncError> {
        let revocation = self.config.endpoints.revoke_url.clone().zip(self.tokens());
        if let Some((revoke_url, tokens)) = revocation {
            let request =
                HttpRequest::post(revoke_url).form(&[("token", tokens.access_token.as_str())]);
            if let Err(e) = self.http.execute(request).await {
                warn!(provider = %self.provider_kind(), error = %e, "token revocation failed");
            }
        }
        *self.tokens.lock().unwrap() = None;
        *self.file_id.lock().unwrap() = None;
        Ok(())
    }

    fn tokens(&self) -> Option<OAuthTokens> {
        self.tokens.lock().unwrap().clone()
    }

    fn set_session(&self, tokens: Option<OAuthTokens>, resource_id: Option<String>) {
        *self.tokens.lock().unwrap() = tokens;
        *self.file_id.lock().unwrap() = resource_id;
    }

    fn resource_id(&self) -> Option<String> {
        self.file_id.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
