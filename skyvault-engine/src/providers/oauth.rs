//! OAuth mechanics shared by the adapters: device-code polling, PKCE,
//! token exchange and refresh-ahead, and the loopback callback listener.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::SyncError;
use crate::http::{HttpClient, HttpRequest};
use crate::providers::{status_error, transport_error};
use crate::types::{OAuthTokens, Provider};
use skyvault_envelope::sha256;

/// Refresh ahead of expiry by this much.
pub const REFRESH_MARGIN_MS: i64 = 60_000;

/// Extra seconds added to the polling interval on `slow_down`.
const SLOW_DOWN_STEP_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Token endpoint wire types
// ---------------------------------------------------------------------------

/// Union of success and error shapes the token endpoints produce.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Relative lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Convert a successful response into a token set.
    fn into_tokens(self, provider: Provider, now_ms: i64) -> Result<OAuthTokens, SyncError> {
        let access_token = self.access_token.ok_or_else(|| SyncError::ProviderBadRequest {
            provider,
            detail: "token response missing access_token".into(),
        })?;
        Ok(OAuthTokens {
            access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_in.map(|secs| now_ms + secs * 1_000),
            token_type: self.token_type.unwrap_or_else(|| "bearer".into()),
            scope: self.scope,
        })
    }
}

// ---------------------------------------------------------------------------
// Device-code flow
// ---------------------------------------------------------------------------

/// Poll the token endpoint until the user approves, the code expires, or the
/// server reports a hard error.
///
/// `authorization_pending` is a soft retry; `slow_down` widens the interval
/// by five seconds as the server demands.
pub async fn poll_device_token(
    http: &dyn HttpClient,
    clock: &dyn Clock,
    provider: Provider,
    token_url: &str,
    client_id: &str,
    device_code: &str,
    interval_secs: u64,
    expires_at: i64,
) -> Result<OAuthTokens, SyncError> {
    let mut interval_secs = interval_secs.max(1);

    loop {
        if clock.now_ms() >= expires_at {
            return Err(SyncError::ProviderBadRequest {
                provider,
                detail: "device code expired".into(),
            });
        }
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;

        let request = HttpRequest::post(token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", client_id),
                ("device_code", device_code),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ]);
        let response = http
            .execute(request)
            .await
            .map_err(|e| transport_error(provider, e))?;
        if !response.is_success() {
            return Err(status_error(provider, &response));
        }

        let mut parsed: TokenResponse = response.json().map_err(|e| SyncError::ProviderBadRequest {
            provider,
            detail: format!("token response: {}", e),
        })?;

        match parsed.error.take().as_deref() {
            None => return parsed.into_tokens(provider, clock.now_ms()),
            Some("authorization_pending") => {
                debug!(%provider, "device authorization pending");
            }
            Some("slow_down") => {
                interval_secs += SLOW_DOWN_STEP_SECS;
                debug!(%provider, interval_secs, "server asked to slow down");
            }
            Some("expired_token") => {
                return Err(SyncError::ProviderBadRequest {
                    provider,
                    detail: "device code expired".into(),
                })
            }
            Some(other) => {
                return Err(SyncError::ProviderBadRequest {
                    provider,
                    detail: format!(
                        "{}: {}",
                        other,
                        parsed.error_description.unwrap_or_default()
                    ),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PKCE
// ---------------------------------------------------------------------------

/// Verifier/challenge/state triple for one authorization attempt. The
/// verifier never leaves process memory.
#[derive(Clone, Debug)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PkceChallenge {
    pub fn generate() -> Result<Self, SyncError> {
        let mut verifier_bytes = [0u8; 32];
        let mut state_bytes = [0u8; 16];
        getrandom::getrandom(&mut verifier_bytes)
            .and_then(|_| getrandom::getrandom(&mut state_bytes))
            .map_err(|_| SyncError::StorageUnavailable("rng".into()))?;

        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        Ok(Self {
            challenge: challenge_for(&verifier),
            verifier,
            state: URL_SAFE_NO_PAD.encode(state_bytes),
        })
    }
}

/// S256: base64url(sha256(verifier)), no padding.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(sha256(verifier.as_bytes()))
}

/// Build the authorization URL the host opens in a browser.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    pkce: &PkceChallenge,
    extra_params: &[(&str, &str)],
) -> Result<String, SyncError> {
    let mut url = url::Url::parse(auth_endpoint).map_err(|e| {
        SyncError::StorageUnavailable(format!("auth endpoint: {}", e))
    })?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &scopes.join(" "))
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", &pkce.state);
    for (name, value) in extra_params {
        url.query_pairs_mut().append_pair(name, value);
    }
    Ok(url.into())
}

/// Exchange an authorization code (plus verifier) for tokens. One shot.
pub async fn exchange_code(
    http: &dyn HttpClient,
    clock: &dyn Clock,
    provider: Provider,
    token_url: &str,
    client_id: &str,
    client_secret: Option<&str>,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<OAuthTokens, SyncError> {
    let mut pairs = vec![
        ("client_id", client_id),
        ("code", code),
        ("code_verifier", verifier),
        ("redirect_uri", redirect_uri),
        ("grant_type", "authorization_code"),
    ];
    if let Some(secret) = client_secret {
        pairs.push(("client_secret", secret));
    }
    post_token_request(http, clock, provider, token_url, &pairs).await
}

/// Redeem a refresh token. The old refresh token is carried forward when the
/// server rotates without returning a new one.
pub async fn refresh_tokens(
    http: &dyn HttpClient,
    clock: &dyn Clock,
    provider: Provider,
    token_url: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> Result<OAuthTokens, SyncError> {
    let mut pairs = vec![
        ("client_id", client_id),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];
    if let Some(secret) = client_secret {
        pairs.push(("client_secret", secret));
    }
    let mut tokens = post_token_request(http, clock, provider, token_url, &pairs).await?;
    if tokens.refresh_token.is_none() {
        tokens.refresh_token = Some(refresh_token.to_string());
    }
    Ok(tokens)
}

/// Refresh-ahead policy: returns a replacement token set when the current one
/// expires within [`REFRESH_MARGIN_MS`], `None` when it is still fresh.
///
/// A token that needs refreshing but has no refresh token, or whose refresh
/// is rejected, surfaces as `ReauthRequired`.
pub async fn ensure_fresh(
    http: &dyn HttpClient,
    clock: &dyn Clock,
    provider: Provider,
    token_url: &str,
    client_id: &str,
    client_secret: Option<&str>,
    tokens: &OAuthTokens,
) -> Result<Option<OAuthTokens>, SyncError> {
    if !tokens.expires_within(clock.now_ms(), REFRESH_MARGIN_MS) {
        return Ok(None);
    }
    let refresh_token = tokens
        .refresh_token
        .as_deref()
        .ok_or(SyncError::ReauthRequired(provider))?;
    match refresh_tokens(http, clock, provider, token_url, client_id, client_secret, refresh_token)
        .await
    {
        Ok(fresh) => Ok(Some(fresh)),
        Err(e) if e.is_retryable() || e == SyncError::Timeout => Err(e),
        Err(e) => {
            warn!(%provider, error = %e, "token refresh rejected");
            Err(SyncError::ReauthRequired(provider))
        }
    }
}

async fn post_token_request(
    http: &dyn HttpClient,
    clock: &dyn Clock,
    provider: Provider,
    token_url: &str,
    pairs: &[(&str, &str)],
) -> Result<OAuthTokens, SyncError> {
    let request = HttpRequest::post(token_url)
        .header("Accept", "application/json")
        .form(pairs);
    let response = http
        .execute(request)
        .await
        .map_err(|e| transport_error(provider, e))?;
    if !response.is_success() {
        return Err(status_error(provider, &response));
    }
    let mut parsed: TokenResponse = response.json().map_err(|e| SyncError::ProviderBadRequest {
        provider,
        detail: format!("token response: {}", e),
    })?;
    if let Some(error) = parsed.error.take() {
        return Err(SyncError::ProviderBadRequest {
            provider,
            detail: format!("{}: {}", error, parsed.error_description.unwrap_or_default()),
        });
    }
    parsed.into_tokens(provider, clock.now_ms())
}

// ---------------------------------------------------------------------------
// Loopback callback listener
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// Accept exactly one `GET /oauth/callback?code=..&state=..` on the loopback
/// interface, answer with a minimal page, and terminate.
pub async fn listen_for_callback(port: u16) -> std::io::Result<CallbackParams> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let (mut stream, _) = listener.accept().await?;

    let mut buffer = vec![0u8; 4096];
    let read = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..read]).into_owned();

    let params = parse_callback_request(&request)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad callback"))?;

    let page = "<html><body>Authorization complete. You can close this window.</body></html>";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        page.len(),
        page
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(params)
}

fn parse_callback_request(request: &str) -> Option<CallbackParams> {
    let line = request.lines().next()?;
    let path = line.split_whitespace().nth(1)?;
    let url = url::Url::parse(&format!("http://127.0.0.1{}", path)).ok()?;
    if url.path() != "/oauth/callback" {
        return None;
    }
    let mut code = None;
    let mut state = None;
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }
    Some(CallbackParams {
        code: code?,
        state: state?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::mock::MockHttpClient;
    use crate::http::Method;
    use serde_json::json;

    const TOKEN_URL: &str = "https://auth.example.test/token";

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        // Appendix B of RFC 7636.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(challenge_for(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn generated_challenges_are_unique_and_well_formed() {
        let a = PkceChallenge::generate().unwrap();
        let b = PkceChallenge::generate().unwrap();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.state, b.state);
        // 32 random bytes encode to 43 url-safe characters.
        assert_eq!(a.verifier.len(), 43);
        assert_eq!(a.challenge, challenge_for(&a.verifier));
    }

    #[test]
    fn auth_url_carries_pkce_parameters() {
        let pkce = PkceChallenge::generate().unwrap();
        let url = build_auth_url(
            "https://auth.example.test/authorize",
            "client-1",
            "http://127.0.0.1:8812/oauth/callback",
            &["files.app".to_string()],
            &pkce,
            &[("access_type", "offline")],
        )
        .unwrap();
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("code_challenge={}", pkce.challenge)));
        assert!(url.contains("access_type=offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn device_poll_retries_pending_then_succeeds() {
        let http = MockHttpClient::new();
        http.expect_json(Method::Post, "/token", 200, json!({"error": "authorization_pending"}));
        http.expect_json(Method::Post, "/token", 200, json!({"error": "authorization_pending"}));
        http.expect_json(
            Method::Post,
            "/token",
            200,
            json!({"access_token": "tok", "token_type": "bearer", "scope": "gist"}),
        );
        let clock = ManualClock::new(0);

        let tokens = poll_device_token(
            &http, &clock, Provider::Gist, TOKEN_URL, "cid", "dev-code", 5, i64::MAX,
        )
        .await
        .unwrap();
        assert_eq!(tokens.access_token, "tok");
        assert_eq!(http.request_count(Method::Post, "/token"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn device_poll_honors_slow_down() {
        let http = MockHttpClient::new();
        http.expect_json(Method::Post, "/token", 200, json!({"error": "slow_down"}));
        http.expect_json(
            Method::Post,
            "/token",
            200,
            json!({"access_token": "tok", "token_type": "bearer"}),
        );
        let clock = ManualClock::new(0);

        let started = tokio::time::Instant::now();
        poll_device_token(&http, &clock, Provider::Gist, TOKEN_URL, "cid", "dc", 5, i64::MAX)
            .await
            .unwrap();
        // First wait 5s, then 5+5s after slow_down.
        assert_eq!(started.elapsed().as_secs(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn device_poll_fails_on_expired_code() {
        let http = MockHttpClient::new();
        let clock = ManualClock::new(10_000);
        let err = poll_device_token(
            &http, &clock, Provider::Gist, TOKEN_URL, "cid", "dc", 5, 9_999,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::ProviderBadRequest { .. }));
        assert_eq!(http.request_count(Method::Post, "/token"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn device_poll_fails_on_hard_error() {
        let http = MockHttpClient::new();
        http.expect_json(Method::Post, "/token", 200, json!({"error": "access_denied"}));
        let clock = ManualClock::new(0);
        let err = poll_device_token(
            &http, &clock, Provider::Gist, TOKEN_URL, "cid", "dc", 1, i64::MAX,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::ProviderBadRequest { .. }));
    }

    #[tokio::test]
    async fn refresh_preserves_old_refresh_token() {
        let http = MockHttpClient::new();
        http.expect_json(
            Method::Post,
            "/token",
            200,
            json!({"access_token": "new", "token_type": "bearer", "expires_in": 3600}),
        );
        let clock = ManualClock::new(1_000_000);
        let tokens = refresh_tokens(
            &http, &clock, Provider::DriveA, TOKEN_URL, "cid", None, "old-refresh",
        )
        .await
        .unwrap();
        assert_eq!(tokens.access_token, "new");
        assert_eq!(tokens.refresh_token.as_deref(), Some("old-refresh"));
        assert_eq!(tokens.expires_at, Some(1_000_000 + 3_600_000));
    }

    #[tokio::test]
    async fn ensure_fresh_skips_live_tokens() {
        let http = MockHttpClient::new();
        let clock = ManualClock::new(0);
        let tokens = OAuthTokens {
            access_token: "tok".into(),
            refresh_token: Some("r".into()),
            expires_at: Some(REFRESH_MARGIN_MS + 1),
            token_type: "bearer".into(),
            scope: None,
        };
        let refreshed = ensure_fresh(
            &http, &clock, Provider::DriveA, TOKEN_URL, "cid", None, &tokens,
        )
        .await
        .unwrap();
        assert!(refreshed.is_none());
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn ensure_fresh_without_refresh_token_needs_reauth() {
        let http = MockHttpClient::new();
        let clock = ManualClock::new(1_000_000);
        let tokens = OAuthTokens {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Some(1_000_000),
            token_type: "bearer".into(),
            scope: None,
        };
        let err = ensure_fresh(
            &http, &clock, Provider::DriveB, TOKEN_URL, "cid", None, &tokens,
        )
        .await
        .unwrap_err();
        assert_eq!(err, SyncError::ReauthRequired(Provider::DriveB));
    }

    #[tokio::test]
    async fn callback_listener_round_trip() {
        let port = 18_432;
        let server = tokio::spawn(listen_for_callback(port));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /oauth/callback?code=abc&state=xyz HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        let params = server.await.unwrap().unwrap();
        assert_eq!(params, CallbackParams { code: "abc".into(), state: "xyz".into() });
    }

    #[test]
    fn callback_parser_rejects_other_paths() {
        assert!(parse_callback_request("GET /favicon.ico HTTP/1.1\r\n").is_none());
        assert!(parse_callback_request("GET /oauth/callback?code=only HTTP/1.1\r\n").is_none());
    }
}
