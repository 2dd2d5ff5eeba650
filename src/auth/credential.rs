use crate::{
    auth::accounts::{AccessToken, Account, AccountService},
    error::Result,
};

/// Every long-lived access token starts with this.
pub const TOKEN_PREFIX: &str = "wpat_";

/// Who is making a request, once their credentials have been checked.
#[derive(Clone, Debug, PartialEq)]
pub enum Credential {
    /// Authentication is switched off; everything is allowed.
    Unrestricted,
    Anonymous,
    /// A session token or username and password.
    Session(Account),
    AccessToken { account: Account, token: AccessToken },
}

impl Credential {
    pub fn account(&self) -> Option<&Account> {
        match self {
            Credential::Session(account) | Credential::AccessToken { account, .. } => {
                Some(account)
            }
            _ => None,
        }
    }
}

pub async fn from_bearer(accounts: &dyn AccountService, token: &str) -> Result<Credential> {
    if token.starts_with(TOKEN_PREFIX) {
        let (account, token) = accounts.validate_pat(token).await?;
        return Ok(Credential::AccessToken { account, token });
    }

    Ok(Credential::Session(
        accounts.validate_session_token(token).await?,
    ))
}

/// Basic credentials carry either a password or, in the password field, an
/// access token.
pub async fn from_basic(
    accounts: &dyn AccountService,
    username: &str,
    password: &str,
) -> Result<Credential> {
    if password.starts_with(TOKEN_PREFIX) {
        let (account, token) = accounts.validate_pat(password).await?;
        return Ok(Credential::AccessToken { account, token });
    }

    Ok(Credential::Session(
        accounts.authenticate_password(username, password).await?,
    ))
}
