//! Tool-level credential lifecycle.
//!
//! Four key spaces, all indexed by [`derive_auth_key`]:
//! `cfg:` scheme + in-flight flow state (CSRF state, PKCE verifier),
//! `tok:` exchanged tokens, `rsp:` one-shot authorization responses
//! deposited by the callback boundary (TTL-bound), and `pend:` the
//! (session, tool call) → auth key routing used to land callbacks on
//! the right suspended invocation.
//!
//! Token acquisition ladder, in order: cached token (30 s expiry
//! skew) → single refresh attempt → deposited response exchanged
//! (authorization-code, PKCE when configured) → build an
//! authorization URL and report `Required`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tiller_domain::{Error, Result};
use tiller_store::KvStore;

const RESPONSE_TTL: Duration = Duration::from_secs(600);
const PENDING_TTL: Duration = Duration::from_secs(600);

/// Refresh window: a token within this skew of expiry is not applied.
const EXPIRY_SKEW_SECS: i64 = 30;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schemes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Scheme {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    #[serde(default)]
    pub use_pkce: bool,
}

/// `Debug` is manually implemented to redact the key.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyScheme {
    pub header: String,
    pub key: String,
}

impl std::fmt::Debug for ApiKeyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyScheme")
            .field("header", &self.header)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthScheme {
    OAuth2(OAuth2Scheme),
    Oidc(OAuth2Scheme),
    ApiKey(ApiKeyScheme),
}

impl AuthScheme {
    pub fn scheme_type(&self) -> &'static str {
        match self {
            Self::OAuth2(_) => "oauth2",
            Self::Oidc(_) => "oidc",
            Self::ApiKey(_) => "api_key",
        }
    }

    /// The identity component of the auth key: which credential slot
    /// this scheme resolves to, never the secret itself.
    fn credential_identity(&self) -> String {
        match self {
            Self::OAuth2(s) | Self::Oidc(s) => s.client_id.clone(),
            Self::ApiKey(s) => hex::encode(Sha256::digest(s.key.as_bytes())),
        }
    }

    fn oauth(&self) -> Option<&OAuth2Scheme> {
        match self {
            Self::OAuth2(s) | Self::Oidc(s) => Some(s),
            Self::ApiKey(_) => None,
        }
    }

    pub fn scopes(&self) -> Vec<String> {
        self.oauth().map(|s| s.scopes.clone()).unwrap_or_default()
    }
}

/// A tool's declared auth requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub scheme: AuthScheme,
}

impl AuthConfig {
    pub fn oauth2(scheme: OAuth2Scheme) -> Self {
        Self {
            scheme: AuthScheme::OAuth2(scheme),
        }
    }

    pub fn api_key(header: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::ApiKey(ApiKeyScheme {
                header: header.into(),
                key: key.into(),
            }),
        }
    }
}

/// Distinct credential slot for (agent, tool, scheme, credential).
pub fn derive_auth_key(agent: &str, tool: &str, scheme_type: &str, credential: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [agent, tool, scheme_type, credential] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-flight authorization flow state, persisted under `cfg:`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub csrf_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkce_verifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAuthConfig {
    pub scheme: AuthScheme,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<FlowState>,
}

/// Exchanged tokens. `Debug` is manually implemented to redact secrets.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangedCredential {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl ExchangedCredential {
    /// True when the token is expired or within the skew of expiry.
    pub fn near_expiry(&self, skew_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|at| at - chrono::TimeDelta::seconds(skew_secs) <= Utc::now())
    }
}

impl std::fmt::Debug for ExchangedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangedCredential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One-shot callback payload deposited under `rsp:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub auth_response_uri: String,
    pub redirect_uri: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AuthStore {
    kv: Arc<dyn KvStore>,
}

impl AuthStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn cfg_key(auth_key: &str) -> String {
        format!("cfg:{auth_key}")
    }
    fn tok_key(auth_key: &str) -> String {
        format!("tok:{auth_key}")
    }
    fn rsp_key(auth_key: &str) -> String {
        format!("rsp:{auth_key}")
    }
    fn pend_key(session_id: &str, tool_call_id: &str) -> String {
        format!("pend:{session_id}:{tool_call_id}")
    }

    pub async fn config(&self, auth_key: &str) -> Result<Option<StoredAuthConfig>> {
        read_typed(&*self.kv, &Self::cfg_key(auth_key)).await
    }

    pub async fn set_config(&self, auth_key: &str, config: &StoredAuthConfig) -> Result<()> {
        self.kv
            .set(&Self::cfg_key(auth_key), serde_json::to_value(config)?)
            .await
    }

    pub async fn tokens(&self, auth_key: &str) -> Result<Option<ExchangedCredential>> {
        read_typed(&*self.kv, &Self::tok_key(auth_key)).await
    }

    pub async fn set_tokens(&self, auth_key: &str, tokens: &ExchangedCredential) -> Result<()> {
        self.kv
            .set(&Self::tok_key(auth_key), serde_json::to_value(tokens)?)
            .await
    }

    pub async fn clear_tokens(&self, auth_key: &str) -> Result<()> {
        self.kv.delete(&Self::tok_key(auth_key)).await?;
        Ok(())
    }

    pub async fn deposit_response(&self, auth_key: &str, response: &AuthResponse) -> Result<()> {
        self.kv
            .set_with_ttl(
                &Self::rsp_key(auth_key),
                serde_json::to_value(response)?,
                RESPONSE_TTL,
            )
            .await
    }

    /// Read and consume the one-shot response.
    pub async fn take_response(&self, auth_key: &str) -> Result<Option<AuthResponse>> {
        let key = Self::rsp_key(auth_key);
        let response = read_typed(&*self.kv, &key).await?;
        if response.is_some() {
            self.kv.delete(&key).await?;
        }
        Ok(response)
    }

    pub async fn register_pending(
        &self,
        session_id: &str,
        tool_call_id: &str,
        auth_key: &str,
    ) -> Result<()> {
        self.kv
            .set_with_ttl(
                &Self::pend_key(session_id, tool_call_id),
                serde_json::Value::String(auth_key.to_owned()),
                PENDING_TTL,
            )
            .await
    }

    pub async fn resolve_pending(
        &self,
        session_id: &str,
        tool_call_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(&Self::pend_key(session_id, tool_call_id))
            .await?
            .and_then(|v| v.as_str().map(String::from)))
    }

    pub async fn health_check(&self) -> Result<()> {
        self.kv.health_check().await
    }
}

async fn read_typed<T: serde::de::DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> Result<Option<T>> {
    match kv.get(key).await? {
        Some(value) => Ok(Some(
            serde_json::from_value(value)
                .map_err(|e| Error::Auth(format!("corrupt auth record {key}: {e}")))?,
        )),
        None => Ok(None),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token exchange
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw token endpoint response. `Debug` redacts secrets.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl From<TokenResponse> for ExchangedCredential {
    fn from(resp: TokenResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: resp
                .expires_in
                .map(|secs| Utc::now() + chrono::TimeDelta::seconds(secs as i64)),
            token_type: resp.token_type,
        }
    }
}

/// The outbound half of the OAuth dance; injected so tests can run the
/// full ladder without a live authorization server.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange_code(
        &self,
        scheme: &OAuth2Scheme,
        code: &str,
        pkce_verifier: Option<&str>,
        redirect_uri: &str,
    ) -> Result<ExchangedCredential>;

    async fn refresh(
        &self,
        scheme: &OAuth2Scheme,
        refresh_token: &str,
    ) -> Result<ExchangedCredential>;
}

pub struct HttpTokenExchanger {
    client: reqwest::Client,
}

impl HttpTokenExchanger {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post_form(
        &self,
        scheme: &OAuth2Scheme,
        form: Vec<(&str, String)>,
    ) -> Result<ExchangedCredential> {
        let resp = self
            .client
            .post(&scheme.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token endpoint unreachable: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Auth(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "token endpoint HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }
        let parsed: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Auth(format!("malformed token response: {e}")))?;
        Ok(parsed.into())
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange_code(
        &self,
        scheme: &OAuth2Scheme,
        code: &str,
        pkce_verifier: Option<&str>,
        redirect_uri: &str,
    ) -> Result<ExchangedCredential> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", scheme.client_id.clone()),
        ];
        if let Some(secret) = &scheme.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        if let Some(verifier) = pkce_verifier {
            form.push(("code_verifier", verifier.to_string()));
        }
        self.post_form(scheme, form).await
    }

    async fn refresh(
        &self,
        scheme: &OAuth2Scheme,
        refresh_token: &str,
    ) -> Result<ExchangedCredential> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", scheme.client_id.clone()),
        ];
        if let Some(secret) = &scheme.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.post_form(scheme, form).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What an authenticated tool applies to its outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCredential {
    pub header: String,
    pub value: String,
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    Ready(AppliedCredential),
    Required {
        auth_key: String,
        authorization_url: Option<String>,
        scopes: Vec<String>,
        scheme_type: String,
    },
}

pub struct AuthRuntime {
    store: AuthStore,
    exchanger: Arc<dyn TokenExchanger>,
    expiry_skew_secs: i64,
}

impl AuthRuntime {
    pub fn new(store: AuthStore, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            store,
            exchanger,
            expiry_skew_secs: EXPIRY_SKEW_SECS,
        }
    }

    pub fn store(&self) -> &AuthStore {
        &self.store
    }

    /// Run the acquisition ladder for one tool invocation.
    pub async fn acquire(
        &self,
        agent: &str,
        tool: &str,
        config: &AuthConfig,
        session_id: &str,
        tool_call_id: &str,
    ) -> Result<AuthDecision> {
        // API keys resolve synchronously; nothing to exchange.
        if let AuthScheme::ApiKey(scheme) = &config.scheme {
            return Ok(AuthDecision::Ready(AppliedCredential {
                header: scheme.header.clone(),
                value: scheme.key.clone(),
            }));
        }

        let auth_key = self.auth_key(agent, tool, config);
        let scheme = config
            .scheme
            .oauth()
            .ok_or_else(|| Error::Auth("scheme has no oauth configuration".into()))?;

        // 1. Cached token, not near expiry.
        if let Some(tokens) = self.store.tokens(&auth_key).await? {
            if !tokens.near_expiry(self.expiry_skew_secs) {
                return Ok(AuthDecision::Ready(apply(&tokens)));
            }
            // 2. Near expiry: one refresh attempt, then fall through.
            if let Some(refresh_token) = tokens.refresh_token.clone() {
                match self.exchanger.refresh(scheme, &refresh_token).await {
                    Ok(mut refreshed) => {
                        if refreshed.refresh_token.is_none() {
                            refreshed.refresh_token = Some(refresh_token);
                        }
                        self.store.set_tokens(&auth_key, &refreshed).await?;
                        return Ok(AuthDecision::Ready(apply(&refreshed)));
                    }
                    Err(e) => {
                        tracing::warn!(auth_key = %auth_key, error = %e, "token refresh failed");
                    }
                }
            }
        }

        // 3. A deposited authorization response.
        if let Some(response) = self.store.take_response(&auth_key).await? {
            let tokens = self.exchange_response(&auth_key, scheme, &response).await?;
            return Ok(AuthDecision::Ready(apply(&tokens)));
        }

        // 4. Start a fresh flow: persist state, route the callback,
        //    and report Required.
        let flow = FlowState {
            csrf_state: random_token(),
            pkce_verifier: scheme.use_pkce.then(random_token),
        };
        let authorization_url = build_authorization_url(scheme, &flow)?;
        self.store
            .set_config(
                &auth_key,
                &StoredAuthConfig {
                    scheme: config.scheme.clone(),
                    state: Some(flow),
                },
            )
            .await?;
        self.store
            .register_pending(session_id, tool_call_id, &auth_key)
            .await?;

        Ok(AuthDecision::Required {
            auth_key,
            authorization_url: Some(authorization_url),
            scopes: scheme.scopes.clone(),
            scheme_type: config.scheme.scheme_type().to_string(),
        })
    }

    /// 401 recovery for authenticated HTTP tools: one refresh-and-retry;
    /// without a refresh token, clear stored tokens to force re-auth on
    /// the next call.
    pub async fn handle_unauthorized(
        &self,
        agent: &str,
        tool: &str,
        config: &AuthConfig,
    ) -> Result<Option<AppliedCredential>> {
        let auth_key = self.auth_key(agent, tool, config);
        let Some(scheme) = config.scheme.oauth() else {
            return Ok(None);
        };
        let Some(tokens) = self.store.tokens(&auth_key).await? else {
            return Ok(None);
        };

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            self.store.clear_tokens(&auth_key).await?;
            return Ok(None);
        };

        match self.exchanger.refresh(scheme, &refresh_token).await {
            Ok(mut refreshed) => {
                if refreshed.refresh_token.is_none() {
                    refreshed.refresh_token = Some(refresh_token);
                }
                self.store.set_tokens(&auth_key, &refreshed).await?;
                Ok(Some(apply(&refreshed)))
            }
            Err(e) => {
                tracing::warn!(auth_key = %auth_key, error = %e, "401 refresh failed");
                self.store.clear_tokens(&auth_key).await?;
                Ok(None)
            }
        }
    }

    /// Deposit a callback payload for a suspended invocation. Returns
    /// `false` when no pending routing exists (expired or unknown).
    pub async fn submit_response(
        &self,
        session_id: &str,
        tool_call_id: &str,
        auth_response_uri: &str,
        redirect_uri: &str,
    ) -> Result<bool> {
        let Some(auth_key) = self.store.resolve_pending(session_id, tool_call_id).await? else {
            return Ok(false);
        };
        self.store
            .deposit_response(
                &auth_key,
                &AuthResponse {
                    auth_response_uri: auth_response_uri.to_owned(),
                    redirect_uri: redirect_uri.to_owned(),
                },
            )
            .await?;
        Ok(true)
    }

    /// Explicit revoke: drop tokens and flow state.
    pub async fn revoke(&self, auth_key: &str) -> Result<()> {
        self.store.clear_tokens(auth_key).await
    }

    pub fn auth_key(&self, agent: &str, tool: &str, config: &AuthConfig) -> String {
        derive_auth_key(
            agent,
            tool,
            config.scheme.scheme_type(),
            &config.scheme.credential_identity(),
        )
    }

    async fn exchange_response(
        &self,
        auth_key: &str,
        scheme: &OAuth2Scheme,
        response: &AuthResponse,
    ) -> Result<ExchangedCredential> {
        let uri = url::Url::parse(&response.auth_response_uri)
            .map_err(|e| Error::Auth(format!("bad auth response uri: {e}")))?;
        let mut code = None;
        let mut state = None;
        for (k, v) in uri.query_pairs() {
            match k.as_ref() {
                "code" => code = Some(v.into_owned()),
                "state" => state = Some(v.into_owned()),
                _ => {}
            }
        }
        let code = code.ok_or_else(|| Error::Auth("auth response has no code".into()))?;

        // Verify CSRF state and pull the PKCE verifier from the stored
        // flow state, then clear it (one flow per challenge).
        let stored = self.store.config(auth_key).await?;
        let flow = stored.as_ref().and_then(|c| c.state.clone());
        if let Some(flow) = &flow {
            if state.as_deref() != Some(flow.csrf_state.as_str()) {
                return Err(Error::Auth("authorization state mismatch".into()));
            }
        }

        let tokens = self
            .exchanger
            .exchange_code(
                scheme,
                &code,
                flow.as_ref().and_then(|f| f.pkce_verifier.as_deref()),
                &response.redirect_uri,
            )
            .await?;

        self.store.set_tokens(auth_key, &tokens).await?;
        if let Some(mut stored) = stored {
            stored.state = None;
            self.store.set_config(auth_key, &stored).await?;
        }
        Ok(tokens)
    }
}

fn apply(tokens: &ExchangedCredential) -> AppliedCredential {
    let token_type = tokens.token_type.as_deref().unwrap_or("Bearer");
    AppliedCredential {
        header: "Authorization".into(),
        value: format!("{token_type} {}", tokens.access_token),
    }
}

fn random_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn build_authorization_url(scheme: &OAuth2Scheme, flow: &FlowState) -> Result<String> {
    let mut url = url::Url::parse(&scheme.authorization_endpoint)
        .map_err(|e| Error::Auth(format!("bad authorization endpoint: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &scheme.client_id)
            .append_pair("redirect_uri", &scheme.redirect_uri)
            .append_pair("state", &flow.csrf_state);
        if !scheme.scopes.is_empty() {
            query.append_pair("scope", &scheme.scopes.join(" "));
        }
        if let Some(verifier) = &flow.pkce_verifier {
            use base64::Engine;
            let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(Sha256::digest(verifier.as_bytes()));
            query
                .append_pair("code_challenge", &challenge)
                .append_pair("code_challenge_method", "S256");
        }
    }
    Ok(url.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tiller_store::InMemoryKv;

    struct FakeExchanger {
        exchanges: Mutex<Vec<(String, Option<String>)>>,
        refreshes: Mutex<Vec<String>>,
        fail_refresh: bool,
    }

    impl FakeExchanger {
        fn new() -> Self {
            Self {
                exchanges: Mutex::new(Vec::new()),
                refreshes: Mutex::new(Vec::new()),
                fail_refresh: false,
            }
        }
    }

    #[async_trait]
    impl TokenExchanger for FakeExchanger {
        async fn exchange_code(
            &self,
            _scheme: &OAuth2Scheme,
            code: &str,
            pkce_verifier: Option<&str>,
            _redirect_uri: &str,
        ) -> Result<ExchangedCredential> {
            self.exchanges
                .lock()
                .push((code.to_owned(), pkce_verifier.map(String::from)));
            Ok(ExchangedCredential {
                access_token: format!("at-for-{code}"),
                refresh_token: Some("rt-1".into()),
                expires_at: Some(Utc::now() + chrono::TimeDelta::seconds(3600)),
                token_type: Some("Bearer".into()),
            })
        }

        async fn refresh(
            &self,
            _scheme: &OAuth2Scheme,
            refresh_token: &str,
        ) -> Result<ExchangedCredential> {
            self.refreshes.lock().push(refresh_token.to_owned());
            if self.fail_refresh {
                return Err(Error::Auth("refresh denied".into()));
            }
            Ok(ExchangedCredential {
                access_token: "at-refreshed".into(),
                refresh_token: None,
                expires_at: Some(Utc::now() + chrono::TimeDelta::seconds(3600)),
                token_type: Some("Bearer".into()),
            })
        }
    }

    fn oauth_config() -> AuthConfig {
        AuthConfig::oauth2(OAuth2Scheme {
            authorization_endpoint: "https://auth.example/authorize".into(),
            token_endpoint: "https://auth.example/token".into(),
            client_id: "client-1".into(),
            client_secret: None,
            scopes: vec!["profile".into()],
            redirect_uri: "https://app.example/callback".into(),
            use_pkce: true,
        })
    }

    fn runtime(exchanger: Arc<FakeExchanger>) -> AuthRuntime {
        AuthRuntime::new(AuthStore::new(Arc::new(InMemoryKv::new())), exchanger)
    }

    #[tokio::test]
    async fn api_key_is_always_ready() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let cfg = AuthConfig::api_key("X-Api-Key", "secret");
        match rt.acquire("a", "t", &cfg, "s", "tc").await.unwrap() {
            AuthDecision::Ready(cred) => {
                assert_eq!(cred.header, "X-Api-Key");
                assert_eq!(cred.value, "secret");
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cold_start_reports_required_with_url() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let cfg = oauth_config();
        let decision = rt.acquire("a", "t", &cfg, "sess-1", "tc-1").await.unwrap();
        match decision {
            AuthDecision::Required {
                auth_key,
                authorization_url,
                scopes,
                scheme_type,
            } => {
                let url = authorization_url.unwrap();
                assert!(url.starts_with("https://auth.example/authorize?"));
                assert!(url.contains("client_id=client-1"));
                assert!(url.contains("code_challenge_method=S256"));
                assert!(url.contains("state="));
                assert_eq!(scopes, vec!["profile"]);
                assert_eq!(scheme_type, "oauth2");
                // Callback routing was registered.
                let resolved = rt
                    .store()
                    .resolve_pending("sess-1", "tc-1")
                    .await
                    .unwrap();
                assert_eq!(resolved.as_deref(), Some(auth_key.as_str()));
            }
            other => panic!("expected Required, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deposited_response_exchanges_with_pkce() {
        let exchanger = Arc::new(FakeExchanger::new());
        let rt = runtime(exchanger.clone());
        let cfg = oauth_config();

        // Start the flow to persist the CSRF state + verifier.
        let decision = rt.acquire("a", "t", &cfg, "sess-1", "tc-1").await.unwrap();
        let AuthDecision::Required { auth_key, .. } = decision else {
            panic!("expected Required");
        };
        let flow = rt
            .store()
            .config(&auth_key)
            .await
            .unwrap()
            .unwrap()
            .state
            .unwrap();

        // Simulate the callback boundary.
        let uri = format!(
            "https://app.example/callback?code=abc123&state={}",
            flow.csrf_state
        );
        assert!(rt
            .submit_response("sess-1", "tc-1", &uri, "https://app.example/callback")
            .await
            .unwrap());

        // Next acquisition exchanges the code and is Ready.
        match rt.acquire("a", "t", &cfg, "sess-1", "tc-1").await.unwrap() {
            AuthDecision::Ready(cred) => {
                assert_eq!(cred.value, "Bearer at-for-abc123");
            }
            other => panic!("expected Ready, got {other:?}"),
        }
        // PKCE verifier was passed through to the exchange.
        let exchanges = exchanger.exchanges.lock();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].0, "abc123");
        assert_eq!(exchanges[0].1.as_deref(), Some(flow.pkce_verifier.unwrap().as_str()));
    }

    #[tokio::test]
    async fn response_is_one_shot() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let cfg = oauth_config();
        let AuthDecision::Required { auth_key, .. } =
            rt.acquire("a", "t", &cfg, "s", "tc").await.unwrap()
        else {
            panic!("expected Required");
        };
        let flow = rt
            .store()
            .config(&auth_key)
            .await
            .unwrap()
            .unwrap()
            .state
            .unwrap();
        let uri = format!("https://cb?code=x&state={}", flow.csrf_state);
        rt.submit_response("s", "tc", &uri, "https://cb").await.unwrap();

        assert!(rt.store().take_response(&auth_key).await.unwrap().is_some());
        assert!(rt.store().take_response(&auth_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_mismatch_is_rejected() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let cfg = oauth_config();
        let AuthDecision::Required { .. } = rt.acquire("a", "t", &cfg, "s", "tc").await.unwrap()
        else {
            panic!("expected Required");
        };
        rt.submit_response("s", "tc", "https://cb?code=x&state=WRONG", "https://cb")
            .await
            .unwrap();
        assert!(rt.acquire("a", "t", &cfg, "s", "tc").await.is_err());
    }

    #[tokio::test]
    async fn cached_token_is_ready() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let cfg = oauth_config();
        let key = rt.auth_key("a", "t", &cfg);
        rt.store()
            .set_tokens(
                &key,
                &ExchangedCredential {
                    access_token: "at-live".into(),
                    refresh_token: None,
                    expires_at: Some(Utc::now() + chrono::TimeDelta::seconds(3600)),
                    token_type: None,
                },
            )
            .await
            .unwrap();
        match rt.acquire("a", "t", &cfg, "s", "tc").await.unwrap() {
            AuthDecision::Ready(cred) => assert_eq!(cred.value, "Bearer at-live"),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn near_expiry_refreshes_once() {
        let exchanger = Arc::new(FakeExchanger::new());
        let rt = runtime(exchanger.clone());
        let cfg = oauth_config();
        let key = rt.auth_key("a", "t", &cfg);
        rt.store()
            .set_tokens(
                &key,
                &ExchangedCredential {
                    access_token: "at-stale".into(),
                    refresh_token: Some("rt-0".into()),
                    expires_at: Some(Utc::now() + chrono::TimeDelta::seconds(5)),
                    token_type: None,
                },
            )
            .await
            .unwrap();

        match rt.acquire("a", "t", &cfg, "s", "tc").await.unwrap() {
            AuthDecision::Ready(cred) => assert_eq!(cred.value, "Bearer at-refreshed"),
            other => panic!("expected Ready, got {other:?}"),
        }
        assert_eq!(exchanger.refreshes.lock().as_slice(), ["rt-0"]);
        // The refresh token is carried forward when the response omits it.
        let stored = rt.store().tokens(&key).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("rt-0"));
    }

    #[tokio::test]
    async fn failed_refresh_falls_through_to_required() {
        let mut exchanger = FakeExchanger::new();
        exchanger.fail_refresh = true;
        let rt = runtime(Arc::new(exchanger));
        let cfg = oauth_config();
        let key = rt.auth_key("a", "t", &cfg);
        rt.store()
            .set_tokens(
                &key,
                &ExchangedCredential {
                    access_token: "at-stale".into(),
                    refresh_token: Some("rt-0".into()),
                    expires_at: Some(Utc::now() - chrono::TimeDelta::seconds(5)),
                    token_type: None,
                },
            )
            .await
            .unwrap();

        match rt.acquire("a", "t", &cfg, "s", "tc").await.unwrap() {
            AuthDecision::Required { .. } => {}
            other => panic!("expected Required, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_clears_tokens() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let cfg = oauth_config();
        let key = rt.auth_key("a", "t", &cfg);
        rt.store()
            .set_tokens(
                &key,
                &ExchangedCredential {
                    access_token: "at-bad".into(),
                    refresh_token: None,
                    expires_at: None,
                    token_type: None,
                },
            )
            .await
            .unwrap();

        let retry = rt.handle_unauthorized("a", "t", &cfg).await.unwrap();
        assert!(retry.is_none());
        assert!(rt.store().tokens(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unauthorized_with_refresh_retries() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let cfg = oauth_config();
        let key = rt.auth_key("a", "t", &cfg);
        rt.store()
            .set_tokens(
                &key,
                &ExchangedCredential {
                    access_token: "at-bad".into(),
                    refresh_token: Some("rt-0".into()),
                    expires_at: None,
                    token_type: None,
                },
            )
            .await
            .unwrap();

        let retry = rt.handle_unauthorized("a", "t", &cfg).await.unwrap();
        assert_eq!(retry.unwrap().value, "Bearer at-refreshed");
    }

    #[test]
    fn auth_key_is_stable_and_distinct() {
        let a = derive_auth_key("agent", "tool", "oauth2", "client-1");
        let b = derive_auth_key("agent", "tool", "oauth2", "client-1");
        assert_eq!(a, b);
        assert_ne!(a, derive_auth_key("agent", "tool", "oauth2", "client-2"));
        assert_ne!(a, derive_auth_key("agent", "other", "oauth2", "client-1"));
    }

    #[tokio::test]
    async fn submit_to_unknown_pending_is_false() {
        let rt = runtime(Arc::new(FakeExchanger::new()));
        let deposited = rt
            .submit_response("ghost", "tc", "https://cb?code=x", "https://cb")
            .await
            .unwrap();
        assert!(!deposited);
    }

    #[test]
    fn debug_redacts_secrets() {
        let cred = ExchangedCredential {
            access_token: "super-secret".into(),
            refresh_token: Some("also-secret".into()),
            expires_at: None,
            token_type: None,
        };
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("also-secret"));
    }
}
