use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jwt_simple::prelude::*;
use tracing::{debug, info};

use crate::{
    auth::{credential::TOKEN_PREFIX, scope::Scope},
    config::AuthenticationConfig,
    digest::Digest,
    error::{Error, Result},
};

#[derive(Clone, Debug, PartialEq)]
pub struct Account {
    pub id: u64,
    pub username: String,
    pub admin: bool,
    pub active: bool,
    pub projects: BTreeMap<String, Scope>,
}

impl Account {
    /// Role on a project. Administrators hold `admin` everywhere.
    pub fn permission(&self, project: &str) -> Option<Scope> {
        if self.admin {
            return Some(Scope::Admin);
        }

        self.projects
            .get(project)
            .or_else(|| self.projects.get("*"))
            .copied()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccessToken {
    pub id: String,
    pub user_id: u64,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

/// Identity lookups. Failures to authenticate are [`Error::Unauthorized`].
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn get_user_by_id(&self, id: u64) -> Result<Option<Account>>;

    async fn validate_session_token(&self, token: &str) -> Result<Account>;

    async fn validate_pat(&self, token: &str) -> Result<(Account, AccessToken)>;

    async fn authenticate_password(&self, username: &str, password: &str) -> Result<Account>;
}

/// Accounts and access tokens declared in the configuration file.
pub struct StaticAccounts {
    users: HashMap<u64, (Account, String)>,
    tokens: HashMap<String, AccessToken>,
    key: HS256Key,
}

impl StaticAccounts {
    pub fn new(config: &AuthenticationConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|user| {
                (
                    user.id,
                    (
                        Account {
                            id: user.id,
                            username: user.username.clone(),
                            admin: user.admin,
                            active: user.active,
                            projects: user.projects.clone(),
                        },
                        user.password.clone(),
                    ),
                )
            })
            .collect();

        let tokens = config
            .tokens
            .iter()
            .map(|token| {
                (
                    token.token_sha256.to_ascii_lowercase(),
                    AccessToken {
                        id: token.id.clone(),
                        user_id: token.user_id,
                        scopes: token.scopes.clone(),
                        expires_at: token.expires_at,
                        revoked: token.revoked,
                    },
                )
            })
            .collect();

        Self {
            users,
            tokens,
            key: HS256Key::from_bytes(config.session_secret.as_bytes()),
        }
    }

    fn active_user(&self, id: u64) -> Result<Account> {
        match self.users.get(&id) {
            Some((account, _)) if account.active => Ok(account.clone()),
            Some(_) => {
                info!(user = id, "Rejected credentials for disabled account");
                Err(Error::Unauthorized)
            }
            None => Err(Error::Unauthorized),
        }
    }
}

#[async_trait]
impl AccountService for StaticAccounts {
    async fn get_user_by_id(&self, id: u64) -> Result<Option<Account>> {
        Ok(self.users.get(&id).map(|(account, _)| account.clone()))
    }

    async fn validate_session_token(&self, token: &str) -> Result<Account> {
        let claims = self
            .key
            .verify_token::<NoCustomClaims>(token, None)
            .map_err(|err| {
                info!("Could not verify session token: {err}");
                Error::Unauthorized
            })?;

        let subject = claims
            .subject
            .and_then(|subject| subject.parse::<u64>().ok())
            .ok_or_else(|| {
                info!("Session token has no usable subject");
                Error::Unauthorized
            })?;

        debug!(user = subject, "Validated session token");

        self.active_user(subject)
    }

    async fn validate_pat(&self, token: &str) -> Result<(Account, AccessToken)> {
        if !token.starts_with(TOKEN_PREFIX) {
            return Err(Error::Unauthorized);
        }

        let hash = Digest::of(token.as_bytes()).hash;
        let record = self.tokens.get(&hash).ok_or(Error::Unauthorized)?;

        if record.revoked {
            info!(token = %record.id, "Rejected revoked access token");
            return Err(Error::Unauthorized);
        }

        if record.expires_at.is_some_and(|expiry| expiry <= Utc::now()) {
            info!(token = %record.id, "Rejected expired access token");
            return Err(Error::Unauthorized);
        }

        let account = self.active_user(record.user_id)?;

        Ok((account, record.clone()))
    }

    async fn authenticate_password(&self, username: &str, password: &str) -> Result<Account> {
        let Some((account, hash)) = self
            .users
            .values()
            .find(|(account, _)| account.username == username)
        else {
            return Err(Error::Unauthorized);
        };

        if !pwhash::unix::verify(password, hash) {
            info!(username, "Password mismatch");
            return Err(Error::Unauthorized);
        }

        self.active_user(account.id)
    }
}
