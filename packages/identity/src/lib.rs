//! Payrail Identity
//!
//! Creates and authenticates users, issues and revokes bearer tokens, and
//! resolves transfer receivers by email. Password hashing is Argon2id with
//! per-password salts; tokens are opaque random strings stored only as
//! digests.

use std::sync::Arc;

use payrail_ledger::model::{NewUser, User};
use payrail_ledger::store::{StoreError, TokenStore, UserStore};

pub mod password;
pub mod token;

pub use password::Hasher;

/// Registration input. Validation rules are deliberately liberal: this
/// service cares that an email can receive a transfer, not that it parses
/// per RFC.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
}

impl Registration {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().chars().count() < 2 {
            errors.push("name must be at least 2 characters".to_string());
        }
        if !email_shape_ok(&self.email) {
            errors.push("email must be a valid email address".to_string());
        }
        if self.password.chars().count() < 8 {
            errors.push("password must be at least 8 characters".to_string());
        }
        if self.password != self.password_confirmation {
            errors.push("password confirmation does not match".to_string());
        }
        errors
    }
}

/// The liberal `.+@.+\..+` shape: something before the @, and a domain
/// with at least one dot that is neither first nor last.
fn email_shape_ok(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((head, tail)) => !head.is_empty() && !tail.is_empty(),
        None => false,
    }
}

/// Identity errors.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("email is already registered")]
    EmailInUse,

    #[error("validation failed")]
    Validation { errors: Vec<String> },

    #[error("receiver not found")]
    ReceiverNotFound,

    #[error("you cannot send money to yourself")]
    SelfTransferForbidden,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Identity service. Cheap to clone; instances share the store and hasher.
pub struct Identity<S> {
    store: Arc<S>,
    hasher: Arc<Hasher>,
}

impl<S> Clone for Identity<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            hasher: self.hasher.clone(),
        }
    }
}

impl<S: UserStore + TokenStore> Identity<S> {
    pub fn new(store: Arc<S>, hasher: Hasher) -> Self {
        Self {
            store,
            hasher: Arc::new(hasher),
        }
    }

    /// Register a new user and issue their first token. New accounts start
    /// with a zero balance and a matching frozen initial balance.
    pub async fn register(&self, registration: Registration) -> Result<(User, String), IdentityError> {
        let errors = registration.validate();
        if !errors.is_empty() {
            return Err(IdentityError::Validation { errors });
        }

        let password_hash = self
            .hasher
            .hash(&registration.password)
            .map_err(|e| IdentityError::Hash(e.to_string()))?;

        let user = self
            .store
            .insert_user(NewUser {
                name: registration.name.trim().to_string(),
                email: registration.email.clone(),
                password_hash,
                balance: 0,
                initial_balance: 0,
            })
            .await
            .map_err(|err| match err {
                StoreError::Duplicate { .. } => IdentityError::EmailInUse,
                other => IdentityError::Store(other),
            })?;

        let token = self.issue_token(user.id).await?;
        tracing::info!(user_id = user.id, "user registered");
        Ok((user, token))
    }

    /// Authenticate by email and password. Returns `None` both for an
    /// unknown email and a wrong password; the caller's error message must
    /// not distinguish the two.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<(User, String)>, IdentityError> {
        match self.store.find_user_by_email(email).await? {
            Some(user) if self.hasher.verify(password, &user.password_hash) => {
                let token = self.issue_token(user.id).await?;
                tracing::info!(user_id = user.id, "user logged in");
                Ok(Some((user, token)))
            }
            Some(_) => Ok(None),
            None => {
                // Burn comparable work so response timing does not reveal
                // which of the two checks failed.
                let _ = self.hasher.hash(password);
                Ok(None)
            }
        }
    }

    /// Resolve a live bearer token to its owning user.
    pub async fn authenticate(&self, token: &str) -> Result<Option<User>, IdentityError> {
        Ok(self.store.find_user_by_token(&token::digest(token)).await?)
    }

    /// Revoke the specific token used on this call. Other sessions survive.
    pub async fn logout(&self, user: &User, token: &str) -> Result<bool, IdentityError> {
        let revoked = self
            .store
            .revoke_token(user.id, &token::digest(token))
            .await?;
        if revoked {
            tracing::info!(user_id = user.id, "token revoked");
        }
        Ok(revoked)
    }

    /// Resolve a transfer receiver by email.
    pub async fn resolve_receiver(&self, email: &str, caller: &User) -> Result<User, IdentityError> {
        if email == caller.email {
            return Err(IdentityError::SelfTransferForbidden);
        }
        self.store
            .find_user_by_email(email)
            .await?
            .ok_or(IdentityError::ReceiverNotFound)
    }

    async fn issue_token(&self, user_id: i64) -> Result<String, IdentityError> {
        let token = token::generate();
        self.store
            .insert_token(user_id, &token::digest(&token))
            .await?;
        Ok(token)
    }
}
