//! # Identity / Subscription Lookup Seam
//!
//! Resolves an optional client-supplied user id to a stable identity with
//! a premium flag and subscription tier. Sessions without a user id run as
//! the `anonymous` sentinel identity on the free tier.

use crate::usage::quota::Tier;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Sentinel user id for sessions without an authenticated identity.
pub const ANONYMOUS_USER: &str = "anonymous";

/// A resolved identity, as seen by the session coordinator.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub premium: bool,
    pub tier: Tier,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            user_id: ANONYMOUS_USER.to_string(),
            premium: false,
            tier: Tier::Free,
        }
    }

    /// Whether this identity is subject to usage accounting.
    /// Anonymous sessions are not tracked against a ledger record.
    pub fn is_authenticated(&self) -> bool {
        self.user_id != ANONYMOUS_USER
    }
}

/// Errors surfaced by the identity backend.
#[derive(Debug)]
pub enum IdentityError {
    /// Lookup backend unavailable or returned garbage
    Lookup(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Lookup(msg) => write!(f, "identity lookup error: {}", msg),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Identity resolution. One implementation per auth backend.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve an optional user id to an identity.
    ///
    /// `None` (or an empty id) resolves to the anonymous identity.
    async fn resolve(&self, user_id: Option<&str>) -> Result<Identity, IdentityError>;
}

/// In-memory identity table. Unknown-but-present user ids resolve to a
/// free-tier identity with that id, so development clients don't need to
/// be pre-registered.
pub struct StaticIdentityProvider {
    users: RwLock<HashMap<String, Identity>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, identity: Identity) {
        self.users
            .write()
            .unwrap()
            .insert(identity.user_id.clone(), identity);
    }
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn resolve(&self, user_id: Option<&str>) -> Result<Identity, IdentityError> {
        let id = match user_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Ok(Identity::anonymous()),
        };

        if let Some(identity) = self.users.read().unwrap().get(id) {
            return Ok(identity.clone());
        }

        Ok(Identity {
            user_id: id.to_string(),
            premium: false,
            tier: Tier::Free,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_user_id_resolves_to_anonymous() {
        let provider = StaticIdentityProvider::new();
        let identity = provider.resolve(None).await.unwrap();
        assert_eq!(identity.user_id, ANONYMOUS_USER);
        assert!(!identity.premium);
        assert!(!identity.is_authenticated());

        let identity = provider.resolve(Some("  ")).await.unwrap();
        assert_eq!(identity.user_id, ANONYMOUS_USER);
    }

    #[tokio::test]
    async fn registered_user_keeps_tier_and_premium_flag() {
        let provider = StaticIdentityProvider::new();
        provider.insert(Identity {
            user_id: "user-1".to_string(),
            premium: true,
            tier: Tier::Premium,
        });

        let identity = provider.resolve(Some("user-1")).await.unwrap();
        assert!(identity.premium);
        assert_eq!(identity.tier, Tier::Premium);
        assert!(identity.is_authenticated());
    }

    #[tokio::test]
    async fn unknown_user_defaults_to_free_tier() {
        let provider = StaticIdentityProvider::new();
        let identity = provider.resolve(Some("stranger")).await.unwrap();
        assert_eq!(identity.user_id, "stranger");
        assert_eq!(identity.tier, Tier::Free);
        assert!(!identity.premium);
    }
}
