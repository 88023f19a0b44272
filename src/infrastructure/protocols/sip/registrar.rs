//! SIP Registrar - manages endpoint registrations (RFC 3261 Section 10)

use super::auth::{AuthOutcome, AuthRole, Authenticator};
use super::builder::ResponseBuilder;
use super::handler::SipHandler;
use super::message::{header_param, header_uri, SipError, SipHeaders, SipMethod, SipRequest, SipResponse};
use crate::domain::location::{ContactBinding, LocationStore};
use crate::domain::shared::SipUri;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Expiry limits and user policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarSettings {
    /// Used when neither the contact nor the request gives an expiry
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
    /// Unknown users are created on their first REGISTER instead of 404
    pub register_new_users: bool,
}

impl Default for RegistrarSettings {
    fn default() -> Self {
        Self {
            default_expires: 3600, // 1 hour
            min_expires: 60,       // 1 minute
            max_expires: 7200,     // 2 hours
            register_new_users: false,
        }
    }
}

/// Registrar backed by a location store
pub struct Registrar {
    location: Arc<dyn LocationStore>,
    settings: RegistrarSettings,
    /// Optional digest authentication
    auth: Option<Arc<dyn Authenticator>>,
}

impl Registrar {
    pub fn new(location: Arc<dyn LocationStore>, settings: RegistrarSettings) -> Self {
        Self {
            location,
            settings,
            auth: None,
        }
    }

    /// Create registrar with authentication
    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Get effective expiration time
    fn get_expires(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(0) => 0, // Unregister
            Some(expires) if expires < self.settings.min_expires => self.settings.min_expires,
            Some(expires) if expires > self.settings.max_expires => self.settings.max_expires,
            Some(expires) => expires,
            None => self.settings.default_expires,
        }
    }

    /// User part of the To header (the address of record)
    fn extract_user(request: &SipRequest) -> Result<String, SipError> {
        let to = request
            .header("To")
            .ok_or_else(|| SipError::InvalidMessage("Missing To header".to_string()))?;
        let uri = SipUri::parse(&header_uri(&to))?;
        uri.user()
            .map(str::to_string)
            .ok_or_else(|| SipError::InvalidMessage("To header without user".to_string()))
    }

    /// Remove every contact of the user except static ones
    async fn unregister_all(&self, user: &str) -> Result<(), SipError> {
        for binding in self.location.contacts_of(user).await? {
            if binding.is_static() {
                debug!("Keeping static contact {} of {}", binding.uri, user);
                continue;
            }
            self.location.remove_contact(user, &binding.uri).await?;
        }
        info!("Unregistered all contacts of {}", user);
        Ok(())
    }

    async fn update_binding(&self, user: &str, contact: &str, expires: u32) -> Result<(), SipError> {
        let uri = header_uri(contact);
        let existing = self.location.contacts_of(user).await?;
        if existing.iter().any(|b| b.uri == uri && b.is_static()) {
            debug!("Contact {} of {} is static, left unchanged", uri, user);
            return Ok(());
        }

        if expires == 0 {
            info!("Unregistering: {} -> {}", user, uri);
            self.location.remove_contact(user, &uri).await?;
        } else {
            let expires_at = Utc::now() + Duration::seconds(i64::from(expires));
            self.location.add_contact(user, &uri, expires_at).await?;
            info!("Registered: {} -> {} (expires in {}s)", user, uri, expires);
        }
        Ok(())
    }

    async fn register(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let user = Self::extract_user(request)?;

        if !self.location.has_user(&user).await? {
            if !self.settings.register_new_users {
                warn!("REGISTER for unknown user {}", user);
                return ResponseBuilder::new(404).build_for_request(request);
            }
            info!("Adding new user {}", user);
            self.location.add_user(&user).await?;
        }

        let contacts = request.header_entries("Contact");
        let header_expires = request.expires();

        if contacts.iter().any(|c| c.trim() == "*") {
            if contacts.len() != 1 || header_expires != Some(0) {
                warn!("Wildcard REGISTER for {} without Expires: 0", user);
                return ResponseBuilder::new(400).build_for_request(request);
            }
            self.unregister_all(&user).await?;
        } else {
            for contact in &contacts {
                let requested = header_param(contact, "expires")
                    .and_then(|v| v.parse().ok())
                    .or(header_expires);
                let expires = self.get_expires(requested);
                self.update_binding(&user, contact, expires).await?;
            }
        }

        // Build response with the current bindings
        let mut builder = ResponseBuilder::ok();
        for binding in self.location.contacts_of(&user).await? {
            builder = builder.with("Contact", Self::contact_value(&binding));
        }
        builder.build_for_request(request)
    }

    fn contact_value(binding: &ContactBinding) -> String {
        format!("<{}>;expires={}", binding.uri, binding.remaining_secs())
    }
}

#[async_trait]
impl SipHandler for Registrar {
    async fn handle_request(&self, request: SipRequest) -> Result<SipResponse, SipError> {
        debug!("Handling REGISTER request");

        // Check authentication if enabled
        if let Some(auth) = &self.auth {
            match auth.authenticate(&request, AuthRole::Registrar).await? {
                AuthOutcome::Authenticated(username) => {
                    info!("REGISTER authenticated for user: {}", username);
                }
                AuthOutcome::Challenge(challenge) => {
                    warn!("REGISTER not authenticated - sending challenge");
                    return Ok(challenge);
                }
            }
        }

        self.register(&request).await
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        matches!(method, SipMethod::Register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::location::binding::STATIC_CONTACT_SECS;
    use crate::domain::location::repository::MockLocationStore;
    use crate::domain::DomainError;
    use crate::infrastructure::persistence::InMemoryLocationStore;
    use crate::infrastructure::protocols::sip::auth::DigestAuth;

    fn register(contact: &str, expires: Option<u32>) -> SipRequest {
        let expires = expires
            .map(|e| format!("Expires: {}\r\n", e))
            .unwrap_or_default();
        let data = format!(
            "REGISTER sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKreg\r\n\
             From: <sip:alice@example.com>;tag=r1\r\n\
             To: <sip:alice@example.com>\r\n\
             Call-ID: reg-1\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: {}\r\n\
             {}\
             Content-Length: 0\r\n\r\n",
            contact, expires
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    async fn store_with_alice() -> Arc<InMemoryLocationStore> {
        let store = Arc::new(InMemoryLocationStore::new());
        store.add_user("alice").await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_register_and_clamp() {
        let store = store_with_alice().await;
        let registrar = Registrar::new(store.clone(), RegistrarSettings::default());

        let response = registrar
            .handle_request(register("<sip:alice@10.0.0.1:5060>", Some(999_999)))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 200);

        let contacts = store.contacts_of("alice").await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].uri, "sip:alice@10.0.0.1:5060");
        assert!(contacts[0].remaining_secs() <= 7200);
        assert_eq!(response.header_entries("Contact").len(), 1);
    }

    #[tokio::test]
    async fn test_contact_expires_param_overrides_header() {
        let store = store_with_alice().await;
        let registrar = Registrar::new(store.clone(), RegistrarSettings::default());
        registrar
            .handle_request(register("<sip:alice@10.0.0.1>;expires=0", Some(3600)))
            .await
            .unwrap();
        assert!(store.contacts_of("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_keeps_static_contacts() {
        let store = store_with_alice().await;
        store
            .add_contact(
                "alice",
                "sip:alice@desk.example.com",
                Utc::now() + Duration::seconds(STATIC_CONTACT_SECS),
            )
            .await
            .unwrap();
        let registrar = Registrar::new(store.clone(), RegistrarSettings::default());
        registrar
            .handle_request(register("<sip:alice@10.0.0.1>", Some(3600)))
            .await
            .unwrap();
        assert_eq!(store.contacts_of("alice").await.unwrap().len(), 2);

        let response = registrar.handle_request(register("*", Some(0))).await.unwrap();
        assert_eq!(response.status_code(), 200);
        let left = store.contacts_of("alice").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].uri, "sip:alice@desk.example.com");
    }

    #[tokio::test]
    async fn test_wildcard_requires_zero_expires() {
        let store = store_with_alice().await;
        let registrar = Registrar::new(store, RegistrarSettings::default());
        let response = registrar.handle_request(register("*", Some(60))).await.unwrap();
        assert_eq!(response.status_code(), 400);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let mut store = MockLocationStore::new();
        store.expect_has_user().returning(|_| Ok(false));
        let registrar = Registrar::new(Arc::new(store), RegistrarSettings::default());
        let response = registrar
            .handle_request(register("<sip:alice@10.0.0.1>", None))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 404);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let mut store = MockLocationStore::new();
        store
            .expect_has_user()
            .returning(|_| Err(DomainError::Storage("backend down".to_string())));
        let registrar = Registrar::new(Arc::new(store), RegistrarSettings::default());
        let result = registrar
            .handle_request(register("<sip:alice@10.0.0.1>", None))
            .await;
        assert!(matches!(result, Err(SipError::Internal(_))));
    }

    #[tokio::test]
    async fn test_register_new_users() {
        let store = Arc::new(InMemoryLocationStore::new());
        let settings = RegistrarSettings {
            register_new_users: true,
            ..RegistrarSettings::default()
        };
        let registrar = Registrar::new(store.clone(), settings);
        let response = registrar
            .handle_request(register("<sip:alice@10.0.0.1>", None))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 200);
        assert!(store.has_user("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_challenge_without_credentials() {
        let store = store_with_alice().await;
        let auth = DigestAuth::new("example.com");
        auth.add_user("alice", "secret").await;
        let registrar = Registrar::new(store, RegistrarSettings::default()).with_auth(Arc::new(auth));

        let response = registrar
            .handle_request(register("<sip:alice@10.0.0.1>", None))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 401);
        assert!(response.has_header("WWW-Authenticate"));
    }
}
