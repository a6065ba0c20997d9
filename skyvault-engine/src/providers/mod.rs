//! Provider adapters: one uniform contract over gist-style and drive-style
//! backends.
//!
//! Adapters own exactly two pieces of mutable state — their tokens and the
//! opaque container identifier — and nothing else. Everything an adapter
//! learns is handed back to the orchestrator for persistence.

pub mod drive;
pub mod gist;
pub mod oauth;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::http::{HttpError, HttpResponse};
use crate::types::{AccountInfo, OAuthTokens, Provider};
use skyvault_envelope::SyncedFile;

// ---------------------------------------------------------------------------
// Auth handshake types
// ---------------------------------------------------------------------------

/// What `start_auth` hands the host. Device-flow providers return a code to
/// display; PKCE providers return a URL to open in a browser.
#[derive(Clone, Debug)]
pub enum AuthStart {
    DeviceCode {
        /// Shown to the user together with `verification_uri`.
        user_code: String,
        verification_uri: String,
        /// Polling cadence in seconds, as dictated by the server.
        interval_secs: u64,
        /// Absolute expiry of the device code, milliseconds since epoch.
        expires_at: i64,
        /// Opaque code the host echoes back in the evidence.
        device_code: String,
    },
    Pkce {
        auth_url: String,
        redirect_uri: String,
        /// Echoed back in the evidence and validated against the callback.
        state: String,
    },
}

/// What the host hands back to `complete_auth`.
#[derive(Clone, Debug)]
pub enum AuthEvidence {
    DeviceCode {
        device_code: String,
        interval_secs: u64,
        expires_at: i64,
    },
    Pkce {
        code: String,
        state: String,
        redirect_uri: String,
    },
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CloudAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Begin the provider's auth flow. PKCE providers require `redirect_uri`.
    async fn start_auth(&self, redirect_uri: Option<String>) -> Result<AuthStart, SyncError>;

    /// Finish the flow, returning tokens and whatever account identity the
    /// provider exposes. Tokens are installed on the adapter as a side
    /// effect.
    async fn complete_auth(
        &self,
        evidence: AuthEvidence,
    ) -> Result<(OAuthTokens, Option<AccountInfo>), SyncError>;

    /// Locate or create the container file; returns its opaque identifier.
    async fn initialize_sync(&self) -> Result<Option<String>, SyncError>;

    /// Write the JSON form of `file` into the container.
    async fn upload(&self, file: &SyncedFile) -> Result<(), SyncError>;

    /// Read and parse the container. `None` means "not yet present".
    async fn download(&self) -> Result<Option<SyncedFile>, SyncError>;

    /// Drop tokens locally; revocation is best-effort.
    async fn sign_out(&self) -> Result<(), SyncError>;

    /// Current token set, including any refresh performed since the last
    /// call. The orchestrator persists these.
    fn tokens(&self) -> Option<OAuthTokens>;

    /// Install persisted session state (on startup or external change).
    fn set_session(&self, tokens: Option<OAuthTokens>, resource_id: Option<String>);

    fn resource_id(&self) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Shared error mapping
// ---------------------------------------------------------------------------

/// Map a transport failure into the engine error vocabulary.
pub(crate) fn transport_error(provider: Provider, error: HttpError) -> SyncError {
    match error {
        HttpError::Timeout => SyncError::Timeout,
        HttpError::Cancelled => SyncError::CancelledByCaller,
        HttpError::Transport(detail) => SyncError::ProviderTransient { provider, detail },
    }
}

/// Map a non-success status into the engine error vocabulary.
pub(crate) fn status_error(provider: Provider, response: &HttpResponse) -> SyncError {
    match response.status {
        401 | 403 => SyncError::ReauthRequired(provider),
        404 => SyncError::NotFound(provider),
        429 => SyncError::ProviderRateLimited {
            provider,
            retry_after_secs: response
                .header("retry-after")
                .and_then(|v| v.parse().ok()),
        },
        400..=499 => SyncError::ProviderBadRequest {
            provider,
            detail: truncated_body(response),
        },
        _ => SyncError::ProviderTransient {
            provider,
            detail: format!("status {}", response.status),
        },
    }
}

/// A short, secret-free excerpt of an error body for diagnostics.
fn truncated_body(response: &HttpResponse) -> String {
    let text = response.text();
    let snippet: String = text.chars().take(120).collect();
    format!("status {}: {}", response.status, snippet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: Vec<(String, String)>) -> HttpResponse {
        HttpResponse {
            status,
            headers,
            body: b"detail".to_vec(),
        }
    }

    #[test]
    fn status_mapping_matches_policy() {
        let p = Provider::Gist;
        assert_eq!(
            status_error(p, &response(401, vec![])),
            SyncError::ReauthRequired(p)
        );
        assert_eq!(status_error(p, &response(404, vec![])), SyncError::NotFound(p));
        assert_eq!(
            status_error(p, &response(429, vec![("retry-after".into(), "12".into())])),
            SyncError::ProviderRateLimited { provider: p, retry_after_secs: Some(12) }
        );
        assert!(matches!(
            status_error(p, &response(422, vec![])),
            SyncError::ProviderBadRequest { .. }
        ));
        assert!(matches!(
            status_error(p, &response(503, vec![])),
            SyncError::ProviderTransient { .. }
        ));
    }
}
