//! In-memory location store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::location::{ContactBinding, LocationStore};
use crate::domain::shared::Result;

/// Map of user name to contact bindings. Expired bindings are pruned
/// lazily when the user's contacts are read.
#[derive(Default, Clone)]
pub struct InMemoryLocationStore {
    users: Arc<RwLock<HashMap<String, Vec<ContactBinding>>>>,
}

impl InMemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a user with contacts that never expire
    pub async fn add_static_user(&self, user: &str, contacts: &[String]) {
        let mut users = self.users.write().await;
        let bindings = users.entry(user.to_string()).or_default();
        for contact in contacts {
            bindings.retain(|b| &b.uri != contact);
            bindings.push(ContactBinding::static_binding(contact.clone()));
        }
        debug!("Provisioned {} with {} static contacts", user, contacts.len());
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl LocationStore for InMemoryLocationStore {
    async fn has_user(&self, user: &str) -> Result<bool> {
        Ok(self.users.read().await.contains_key(user))
    }

    async fn add_user(&self, user: &str) -> Result<()> {
        self.users.write().await.entry(user.to_string()).or_default();
        Ok(())
    }

    async fn contacts_of(&self, user: &str) -> Result<Vec<ContactBinding>> {
        let mut users = self.users.write().await;
        let Some(bindings) = users.get_mut(user) else {
            return Ok(Vec::new());
        };
        bindings.retain(|b| !b.is_expired());
        Ok(bindings.clone())
    }

    async fn add_contact(&self, user: &str, uri: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let mut users = self.users.write().await;
        let bindings = users.entry(user.to_string()).or_default();
        bindings.retain(|b| b.uri != uri);
        bindings.push(ContactBinding::new(uri, expires_at));
        Ok(())
    }

    async fn remove_contact(&self, user: &str, uri: &str) -> Result<()> {
        if let Some(bindings) = self.users.write().await.get_mut(user) {
            bindings.retain(|b| b.uri != uri);
        }
        Ok(())
    }
}
