//! Location store interface

use super::binding::ContactBinding;
use crate::domain::shared::Result;
use chrono::{DateTime, Utc};

/// Where users can currently be reached
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait LocationStore: Send + Sync {
    /// Whether the user is known to this domain
    async fn has_user(&self, user: &str) -> Result<bool>;

    /// Declare a new user with no contacts
    async fn add_user(&self, user: &str) -> Result<()>;

    /// Current, non-expired contacts of a user
    async fn contacts_of(&self, user: &str) -> Result<Vec<ContactBinding>>;

    /// Add or replace the binding for `uri`
    async fn add_contact(&self, user: &str, uri: &str, expires_at: DateTime<Utc>) -> Result<()>;

    async fn remove_contact(&self, user: &str, uri: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::DomainError;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_store_results_through_trait_object() {
        let mut mock = MockLocationStore::new();
        mock.expect_has_user().returning(|user| Ok(user == "alice"));
        mock.expect_add_user()
            .returning(|user| Err(DomainError::ValidationError(format!("{} exists", user))));
        let store: Arc<dyn LocationStore> = Arc::new(mock);

        assert!(store.has_user("alice").await.unwrap());
        assert!(!store.has_user("bob").await.unwrap());
        assert!(matches!(
            store.add_user("alice").await,
            Err(DomainError::ValidationError(_))
        ));
    }
}
