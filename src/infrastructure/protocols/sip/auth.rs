//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! The server side is a pass/challenge gate behind the [`Authenticator`]
//! trait. The same digest computation answers challenges on the client side.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::builder::ResponseBuilder;
use super::message::{split_header_list, SipError, SipHeaders, SipRequest, SipResponse};

/// Nonce lifetime in seconds
const NONCE_MAX_AGE_SECS: u64 = 300;

/// Which side is asking: a registrar answers 401, a proxy 407
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    Registrar,
    Proxy,
}

impl AuthRole {
    pub fn status_code(&self) -> u16 {
        match self {
            AuthRole::Registrar => 401,
            AuthRole::Proxy => 407,
        }
    }

    pub fn challenge_header(&self) -> &'static str {
        match self {
            AuthRole::Registrar => "WWW-Authenticate",
            AuthRole::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn credentials_header(&self) -> &'static str {
        match self {
            AuthRole::Registrar => "Authorization",
            AuthRole::Proxy => "Proxy-Authorization",
        }
    }
}

/// Result of checking a request's credentials
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated(String),
    /// Response to send back instead of serving the request
    Challenge(SipResponse),
}

/// SIP authenticator trait
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &SipRequest, role: AuthRole) -> Result<AuthOutcome, SipError>;

    /// Checks credentials when present, never challenges
    async fn is_authenticated(&self, request: &SipRequest, role: AuthRole) -> bool {
        if !request.has_header(role.credentials_header()) {
            return false;
        }
        matches!(
            self.authenticate(request, role).await,
            Ok(AuthOutcome::Authenticated(_))
        )
    }
}

/// User credentials for authentication
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
    pub realm: String,
}

/// Authentication challenge
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: Self::generate_nonce(),
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
            opaque: None,
        }
    }

    fn generate_nonce() -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        hex::encode(random_bytes)
    }

    /// Parse a WWW-Authenticate / Proxy-Authenticate value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value);
        Ok(Self {
            realm: params
                .get("realm")
                .ok_or_else(|| SipError::Authentication("challenge without realm".to_string()))?
                .to_string(),
            nonce: params
                .get("nonce")
                .ok_or_else(|| SipError::Authentication("challenge without nonce".to_string()))?
                .to_string(),
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
        })
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }

    /// Credentials answering this challenge
    pub fn answer(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let qop = self
            .qop
            .as_deref()
            .and_then(|q| q.split(',').map(str::trim).find(|q| q.eq_ignore_ascii_case("auth")));

        let cnonce = AuthChallenge::generate_nonce();
        let nc = "00000001";
        let response = digest_response(
            username,
            password,
            &self.realm,
            &self.nonce,
            method,
            uri,
            qop.map(|q| (q, nc, cnonce.as_str())),
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            username, self.realm, self.nonce, uri, response, self.algorithm
        );
        if let Some(qop) = qop {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl AuthorizationHeader {
    pub fn from_request(request: &SipRequest, role: AuthRole) -> Result<Self, SipError> {
        let auth_value = request.header(role.credentials_header()).ok_or_else(|| {
            SipError::Authentication(format!("No {} header found", role.credentials_header()))
        })?;

        debug!("Parsing {} header: {}", role.credentials_header(), auth_value);
        let params = parse_digest_params(&auth_value);
        let required = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| SipError::Authentication(format!("Missing {} in credentials", name)))
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        })
    }
}

/// Digest parameters of a challenge or credentials value
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let digest_str = value.trim();
    let digest_str = match digest_str.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("digest ") => &digest_str[7..],
        _ => digest_str,
    };

    split_header_list(digest_str)
        .iter()
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().trim_matches('"').to_string()))
        .collect()
}

/// RFC 2617 response: MD5(HA1:nonce:HA2), or with qop
/// MD5(HA1:nonce:nc:cnonce:qop:HA2)
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    match qop {
        Some((qop, nc, cnonce)) => format!(
            "{:x}",
            md5::compute(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        ),
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

/// Digest authentication against an in-memory user table
pub struct DigestAuth {
    realm: String,
    users: Arc<RwLock<HashMap<String, UserCredentials>>>,
    active_nonces: Arc<RwLock<HashMap<String, std::time::Instant>>>,
}

impl DigestAuth {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            users: Arc::new(RwLock::new(HashMap::new())),
            active_nonces: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub async fn add_user(&self, username: &str, password: &str) {
        let credentials = UserCredentials {
            username: username.to_string(),
            password: password.to_string(),
            realm: self.realm.clone(),
        };

        let mut users = self.users.write().await;
        users.insert(username.to_string(), credentials);
        info!("Added user: {}", username);
    }

    pub async fn create_challenge(&self) -> AuthChallenge {
        let challenge = AuthChallenge::new(&self.realm);

        let mut nonces = self.active_nonces.write().await;
        nonces.retain(|_, issued| issued.elapsed().as_secs() < NONCE_MAX_AGE_SECS);
        nonces.insert(challenge.nonce.clone(), std::time::Instant::now());

        debug!("Created auth challenge with nonce: {}", challenge.nonce);
        challenge
    }

    /// Username of a request carrying valid credentials
    pub async fn verify_request(&self, request: &SipRequest, role: AuthRole) -> Result<String, SipError> {
        let auth = AuthorizationHeader::from_request(request, role)?;

        {
            let nonces = self.active_nonces.read().await;
            let issued = nonces
                .get(&auth.nonce)
                .ok_or_else(|| SipError::Authentication("Invalid or expired nonce".to_string()))?;
            if issued.elapsed().as_secs() > NONCE_MAX_AGE_SECS {
                return Err(SipError::Authentication("Nonce expired".to_string()));
            }
        }

        if auth.realm != self.realm {
            warn!("Realm mismatch: expected {}, got {}", self.realm, auth.realm);
            return Err(SipError::Authentication("Realm mismatch".to_string()));
        }

        let users = self.users.read().await;
        let credentials = users.get(&auth.username).ok_or_else(|| {
            warn!("Authentication failed: unknown user {}", auth.username);
            SipError::Authentication(format!("Unknown user: {}", auth.username))
        })?;

        let method = request
            .method()
            .map(|m| m.as_str())
            .ok_or_else(|| SipError::Authentication("Unsupported method".to_string()))?;
        let qop = match (&auth.qop, &auth.nc, &auth.cnonce) {
            (Some(qop), nc, Some(cnonce)) => Some((
                qop.as_str(),
                nc.as_deref().unwrap_or("00000001"),
                cnonce.as_str(),
            )),
            _ => None,
        };
        let expected = digest_response(
            &auth.username,
            &credentials.password,
            &auth.realm,
            &auth.nonce,
            method,
            &auth.uri,
            qop,
        );

        if auth.response != expected {
            warn!("Authentication failed for user {}: response mismatch", auth.username);
            return Err(SipError::Authentication("Invalid credentials".to_string()));
        }

        info!("Authentication successful for user: {}", auth.username);
        Ok(auth.username)
    }

    /// Clean up old nonces
    pub async fn cleanup_nonces(&self) {
        let mut nonces = self.active_nonces.write().await;
        nonces.retain(|_, time| time.elapsed().as_secs() < NONCE_MAX_AGE_SECS);
    }
}

#[async_trait]
impl Authenticator for DigestAuth {
    async fn authenticate(&self, request: &SipRequest, role: AuthRole) -> Result<AuthOutcome, SipError> {
        if request.has_header(role.credentials_header()) {
            match self.verify_request(request, role).await {
                Ok(user) => return Ok(AuthOutcome::Authenticated(user)),
                Err(e) => debug!("Rejecting credentials: {}", e),
            }
        }

        let challenge = self.create_challenge().await;
        let response = ResponseBuilder::new(role.status_code())
            .with(role.challenge_header(), challenge.to_header_value())
            .build_for_request(request)?;
        Ok(AuthOutcome::Challenge(response))
    }
}
