use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use headers::{
    Authorization, HeaderMapExt,
    authorization::{Basic, Bearer},
};
use tower_http::request_id::RequestId;
use tracing::{debug, info};

use crate::{
    auth::{
        credential::Credential,
        scope::{Denial, Scope, check_scope, parse_scopes},
    },
    error::{Error, RegistryError},
    state::RegistryState,
    store::catalog::project_of,
};

pub mod accounts;
pub mod credential;
pub mod scope;

#[derive(Clone, Debug)]
pub(crate) struct RequestContext {
    pub credential: Credential,
    pub realm: String,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub peer: Option<SocketAddr>,
}

impl RequestContext {
    pub fn challenge(&self, required: Option<Scope>) -> String {
        match required {
            Some(scope) => format!("Basic realm=\"{}\",scope=\"{scope}\"", self.realm),
            None => format!("Basic realm=\"{}\"", self.realm),
        }
    }

    /// Name recorded against pushes, deletes and audit entries.
    pub fn actor(&self) -> String {
        match &self.credential {
            Credential::Unrestricted | Credential::Anonymous => "anonymous".to_string(),
            Credential::Session(account) | Credential::AccessToken { account, .. } => {
                account.username.clone()
            }
        }
    }

    pub fn actor_id(&self) -> Option<u64> {
        self.credential.account().map(|account| account.id)
    }

    /// Token-level check. Session credentials always pass; access tokens
    /// pass if one of their scopes dominates `required`.
    pub fn check_scope(&self, required: Scope) -> Result<(), Denial> {
        match &self.credential {
            Credential::AccessToken { token, .. } => {
                check_scope(&parse_scopes(&token.scopes)?, required)
            }
            _ => Ok(()),
        }
    }

    /// Admits a request needing `required` on a project. An access token is
    /// bounded both by its own scopes and by what its owner holds.
    pub fn authorize_project(&self, project: &str, required: Scope) -> Result<(), RegistryError> {
        let account = match &self.credential {
            Credential::Unrestricted => return Ok(()),
            Credential::Anonymous => {
                return Err(RegistryError::MustAuthenticate {
                    challenge: self.challenge(Some(required)),
                });
            }
            Credential::Session(account) | Credential::AccessToken { account, .. } => account,
        };

        self.check_scope(required).map_err(|denial| {
            info!(user = account.id, project, %denial, "Token scope too narrow");
            Error::Forbidden(denial)
        })?;

        match account.permission(project) {
            Some(granted) if granted.dominates(required) => {
                debug!(user = account.id, project, %required, "Admitted");
                Ok(())
            }
            _ => {
                info!(user = account.id, project, %required, "No project permission");
                Err(Error::Forbidden(Denial::Missing(required)).into())
            }
        }
    }

    pub fn authorize(&self, repository: &str, required: Scope) -> Result<(), RegistryError> {
        self.authorize_project(project_of(repository), required)
    }

    /// Administrative operations need an active administrator, and an
    /// access token must itself carry an admin scope.
    pub fn authorize_admin(&self) -> Result<(), RegistryError> {
        let account = match &self.credential {
            Credential::Unrestricted => return Ok(()),
            Credential::Anonymous => {
                return Err(RegistryError::MustAuthenticate {
                    challenge: self.challenge(Some(Scope::Admin)),
                });
            }
            Credential::Session(account) | Credential::AccessToken { account, .. } => account,
        };

        if !account.admin || !account.active {
            return Err(Error::Forbidden(Denial::NotAdministrator).into());
        }

        self.check_scope(Scope::Admin)
            .map_err(|denial| Error::Forbidden(denial).into())
    }
}

impl FromRequestParts<Arc<RegistryState>> for RequestContext {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<RegistryState>,
    ) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .map(|id| id.to_string());

        let user_agent = parts
            .headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|connect_info| connect_info.0);

        let (Some(config), Some(accounts)) = (&state.config.authentication, &state.accounts)
        else {
            return Ok(RequestContext {
                credential: Credential::Unrestricted,
                realm: String::new(),
                user_agent,
                request_id,
                peer,
            });
        };

        let realm = config.realm.clone();
        let rejected = |err: Error| match err {
            Error::Unauthorized => RegistryError::MustAuthenticate {
                challenge: format!("Basic realm=\"{realm}\""),
            },
            err => err.into(),
        };

        let credential = if parts.headers.get(AUTHORIZATION).is_none() {
            Credential::Anonymous
        } else if let Some(bearer) = parts.headers.typed_get::<Authorization<Bearer>>() {
            credential::from_bearer(accounts.as_ref(), bearer.token())
                .await
                .map_err(rejected)?
        } else if let Some(basic) = parts.headers.typed_get::<Authorization<Basic>>() {
            credential::from_basic(accounts.as_ref(), basic.username(), basic.password())
                .await
                .map_err(rejected)?
        } else {
            info!("Unrecognised Authorization header");
            return Err(rejected(Error::Unauthorized));
        };

        Ok(RequestContext {
            credential,
            realm: config.realm.clone(),
            user_agent,
            request_id,
            peer,
        })
    }
}
