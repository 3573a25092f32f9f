//! Interfaces for the out-of-scope external collaborators this crate
//! consumes (§1 "Out of scope"): the relational user/proxy persistence
//! store. The core only calls these traits; a real deployment supplies an
//! implementation backed by its database of choice.

use async_trait::async_trait;
use gateway_types::User;

#[derive(Debug, Clone, thiserror::Error)]
#[error("repository error: {0}")]
pub struct RepositoryError(pub String);

/// Read access to user records, consumed by token validation and
/// session-attachment (§4.1).
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, RepositoryError>;
}

/// Read access to gateway-wide singleton metadata, consumed by the IP
/// whitelist cache (§4.1 "read-through cached for 15 minutes").
#[async_trait]
pub trait ProxyRepository: Send + Sync {
    /// Returns the current set of whitelist entries as strings (either a
    /// bare IPv4/IPv6 address or a CIDR range). `0.0.0.0/0` disables
    /// filtering.
    async fn ip_whitelist_entries(&self) -> Result<Vec<String>, RepositoryError>;
}

/// An in-memory stand-in for both repositories, useful for tests and for
/// running the gateway without a database wired up.
pub mod in_memory {
    use super::{ProxyRepository, RepositoryError, UserRepository};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use gateway_types::User;

    #[derive(Default)]
    pub struct InMemoryUserRepository {
        users: DashMap<String, User>,
    }

    impl InMemoryUserRepository {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, user: User) {
            self.users.insert(user.user_id.clone(), user);
        }
    }

    #[async_trait]
    impl UserRepository for InMemoryUserRepository {
        async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, RepositoryError> {
            Ok(self.users.get(user_id).map(|r| r.value().clone()))
        }
    }

    pub struct InMemoryProxyRepository {
        entries: Vec<String>,
    }

    impl InMemoryProxyRepository {
        #[must_use]
        pub fn new(entries: Vec<String>) -> Self {
            Self { entries }
        }

        #[must_use]
        pub fn disabled() -> Self {
            Self::new(vec!["0.0.0.0/0".to_string()])
        }
    }

    #[async_trait]
    impl ProxyRepository for InMemoryProxyRepository {
        async fn ip_whitelist_entries(&self) -> Result<Vec<String>, RepositoryError> {
            Ok(self.entries.clone())
        }
    }
}
