//! Caller authentication (HS256 JWT or static API key) and role checks.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use convoy_core::{ConvoyError, ConvoyResult};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Caller role. Declaration order is the privilege order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "agent" => Ok(Role::Agent),
            "admin" => Ok(Role::Admin),
            _ => Err(ConvoyError::validation(format!("unknown role '{s}'"))),
        }
    }
}

/// JWT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// How the caller proved who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Jwt,
    ApiKey,
    /// Authentication is disabled.
    Anonymous,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    pub method: AuthMethod,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            role: Role::Admin,
            method: AuthMethod::Anonymous,
        }
    }
}

/// Auth configuration (`[auth]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret. Unset disables JWT auth.
    pub jwt_secret: Option<String>,
    /// Default lifetime of issued tokens.
    pub token_ttl_secs: Option<u64>,
    /// Static API key → role.
    pub api_keys: HashMap<String, Role>,
}

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Compare two secrets in time independent of their contents and lengths.
///
/// Both sides are hashed first so the constant-time comparison always runs
/// over equal-length digests.
pub fn constant_time_eq(expected: &str, given: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let given = Sha256::digest(given.as_bytes());
    expected.as_slice().ct_eq(given.as_slice()).into()
}

/// Short, non-reversible label for an API key, safe to log.
pub fn key_fingerprint(key: &str) -> String {
    hex::encode(&Sha256::digest(key.as_bytes())[..6])
}

fn unauthorized(msg: impl Into<String>) -> ConvoyError {
    ConvoyError::Unauthorized(msg.into())
}

/// Verifies bearer tokens and API keys.
pub struct Authenticator {
    secret: Option<Vec<u8>>,
    token_ttl: Duration,
    api_keys: Vec<(String, Role)>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let auth = Self {
            secret: config
                .jwt_secret
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
            token_ttl: config
                .token_ttl_secs
                .map_or(DEFAULT_TOKEN_TTL, Duration::from_secs),
            api_keys: config
                .api_keys
                .iter()
                .map(|(k, r)| (k.clone(), *r))
                .collect(),
        };
        if !auth.is_enabled() {
            warn!("No JWT secret or API keys configured, authentication disabled");
        }
        auth
    }

    /// Auth is enforced when a secret or at least one API key is configured.
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some() || !self.api_keys.is_empty()
    }

    fn mac(&self) -> ConvoyResult<HmacSha256> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| ConvoyError::Config("no JWT secret configured".into()))?;
        HmacSha256::new_from_slice(secret)
            .map_err(|e| ConvoyError::Config(format!("invalid JWT secret: {e}")))
    }

    /// Sign a token for `subject`. `ttl` defaults to the configured lifetime.
    pub fn issue_token(
        &self,
        subject: &str,
        role: Role,
        ttl: Option<Duration>,
    ) -> ConvoyResult<String> {
        let now = Utc::now().timestamp();
        let ttl = ttl.unwrap_or(self.token_ttl);
        let claims = Claims {
            sub: subject.to_string(),
            role,
            iat: now,
            exp: now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2),
        };
        let header = URL_SAFE_NO_PAD.encode(JWT_HEADER);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header}.{payload}");

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Check signature, algorithm and expiry.
    pub fn verify_token(&self, token: &str) -> ConvoyResult<Claims> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(unauthorized("malformed token"));
        };

        let header_json: serde_json::Value = URL_SAFE_NO_PAD
            .decode(header)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or_else(|| unauthorized("malformed token header"))?;
        if header_json.get("alg").and_then(|a| a.as_str()) != Some("HS256") {
            return Err(unauthorized("unsupported token algorithm"));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| unauthorized("malformed token signature"))?;
        let mut mac = self.mac().map_err(|_| unauthorized("JWT auth not configured"))?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();
        if !bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
            return Err(unauthorized("invalid token signature"));
        }

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or_else(|| unauthorized("malformed token claims"))?;
        if Utc::now().timestamp() >= claims.exp {
            return Err(unauthorized("token expired"));
        }
        Ok(claims)
    }

    /// Look up an API key. Every configured key is compared so the time
    /// taken does not reveal which one matched.
    pub fn verify_api_key(&self, key: &str) -> ConvoyResult<Role> {
        let mut found = None;
        for (candidate, role) in &self.api_keys {
            if constant_time_eq(candidate, key) {
                found = Some(*role);
            }
        }
        found.ok_or_else(|| unauthorized("invalid API key"))
    }

    /// Resolve the caller. A bearer token takes precedence over an API key.
    pub fn authenticate(
        &self,
        bearer: Option<&str>,
        api_key: Option<&str>,
    ) -> ConvoyResult<Identity> {
        if !self.is_enabled() {
            return Ok(Identity::anonymous());
        }
        if let Some(token) = bearer {
            let claims = self.verify_token(token)?;
            debug!(subject = %claims.sub, role = %claims.role, "Authenticated by token");
            return Ok(Identity {
                subject: claims.sub,
                role: claims.role,
                method: AuthMethod::Jwt,
            });
        }
        if let Some(key) = api_key {
            let role = self.verify_api_key(key)?;
            let subject = format!("api-key:{}", key_fingerprint(key));
            debug!(subject = %subject, role = %role, "Authenticated by API key");
            return Ok(Identity {
                subject,
                role,
                method: AuthMethod::ApiKey,
            });
        }
        Err(unauthorized("missing credentials"))
    }
}

/// Fail with [`ConvoyError::Forbidden`] unless `identity` has at least `min`.
pub fn require_role(identity: &Identity, min: Role) -> ConvoyResult<()> {
    if identity.role >= min {
        return Ok(());
    }
    warn!(subject = %identity.subject, role = %identity.role, required = %min, "Insufficient role");
    Err(ConvoyError::Forbidden(format!(
        "role '{}' required, caller has '{}'",
        min, identity.role
    )))
}
