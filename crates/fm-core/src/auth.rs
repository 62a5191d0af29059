use std::sync::Arc;

use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::store::{CoreError, Store};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Worker,
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Token authority: one admin token minted at startup, one worker token per
/// agent row. The admin token is the only secret held in memory; worker
/// tokens live in the store and are looked up per call.
pub struct Auth {
    admin_token: String,
    store: Arc<Store>,
}

impl Auth {
    /// Mint a fresh admin token. Logged once by the bootstrap so the
    /// operator can copy it.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            admin_token: mint_token(),
            store,
        }
    }

    /// Fixed admin token (tests, or operator-pinned deployments).
    pub fn with_admin_token(store: Arc<Store>, admin_token: impl Into<String>) -> Self {
        Self {
            admin_token: admin_token.into(),
            store,
        }
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    /// Lowercased last four characters of the admin token — the suffix that
    /// scopes multiplexer session names to this server instance.
    pub fn session_suffix(&self) -> String {
        let token = self.admin_token.to_lowercase();
        let start = token.len().saturating_sub(4);
        token[start..].to_string()
    }

    /// Constant-time admin check.
    pub fn is_admin(&self, token: &str) -> bool {
        bool::from(token.as_bytes().ct_eq(self.admin_token.as_bytes()))
    }

    /// Verify a token against an optional required role.
    ///
    /// The admin token satisfies any requirement. A worker token satisfies
    /// `None` or `Some(Role::Worker)`, never `Some(Role::Admin)`.
    pub async fn verify(&self, token: &str, required: Option<Role>) -> Result<bool, CoreError> {
        if self.is_admin(token) {
            return Ok(true);
        }
        match required {
            Some(Role::Admin) => Ok(false),
            _ => Ok(self.store.get_agent_by_token(token).await?.is_some()),
        }
    }

    /// Resolve a worker token to its agent id; `None` for unknown tokens
    /// and for the admin token (the admin is not an agent).
    pub async fn agent_id_for(&self, token: &str) -> Result<Option<String>, CoreError> {
        if self.is_admin(token) {
            return Ok(None);
        }
        Ok(self
            .store
            .get_agent_by_token(token)
            .await?
            .map(|agent| agent.agent_id))
    }
}

/// A 32-character lowercase hex token (UUIDv4 with separators stripped).
pub fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
