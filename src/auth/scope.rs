//! Permission levels and the checks built on them.
//!
//! Scopes form a total order: `read < write < delete < admin`. Holding a
//! scope satisfies any check for a scope it dominates.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Read,
    Write,
    Delete,
    Admin,
}

impl Scope {
    pub fn dominates(self, other: Scope) -> bool {
        self >= other
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Scope::Read),
            "write" => Ok(Scope::Write),
            "delete" => Ok(Scope::Delete),
            "admin" | "admin:*" | "*" => Ok(Scope::Admin),
            other => Err(format!("Unknown scope {other:?}")),
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Read => "read",
            Scope::Write => "write",
            Scope::Delete => "delete",
            Scope::Admin => "admin",
        })
    }
}

/// Why a request was refused. Rendered as the error detail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Denial {
    Missing(Scope),
    MalformedScopes,
    NotAdministrator,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::Missing(scope) => write!(f, "missing-{scope}"),
            Denial::MalformedScopes => f.write_str("malformed-scopes"),
            Denial::NotAdministrator => f.write_str("not-administrator"),
        }
    }
}

/// Parses the scope list carried by an access token. A list that is empty or
/// contains anything unrecognised is malformed as a whole.
pub fn parse_scopes<S: AsRef<str>>(scopes: &[S]) -> Result<Vec<Scope>, Denial> {
    if scopes.is_empty() {
        return Err(Denial::MalformedScopes);
    }

    scopes
        .iter()
        .map(|scope| scope.as_ref().parse().map_err(|_| Denial::MalformedScopes))
        .collect()
}

/// Highest scope in a parsed list.
pub fn ceiling(scopes: &[Scope]) -> Option<Scope> {
    scopes.iter().copied().max()
}

pub fn check_scope(scopes: &[Scope], required: Scope) -> Result<(), Denial> {
    match ceiling(scopes) {
        Some(granted) if granted.dominates(required) => Ok(()),
        Some(_) => Err(Denial::Missing(required)),
        None => Err(Denial::MalformedScopes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(Scope::Admin.dominates(Scope::Delete));
        assert!(Scope::Delete.dominates(Scope::Write));
        assert!(Scope::Write.dominates(Scope::Read));
        assert!(Scope::Read.dominates(Scope::Read));
        assert!(!Scope::Read.dominates(Scope::Write));
        assert!(!Scope::Delete.dominates(Scope::Admin));
    }

    #[test]
    fn parsing() {
        assert_eq!(" Write ".parse::<Scope>(), Ok(Scope::Write));
        assert_eq!("*".parse::<Scope>(), Ok(Scope::Admin));
        assert_eq!("admin:*".parse::<Scope>(), Ok(Scope::Admin));
        assert!("push".parse::<Scope>().is_err());
    }

    #[test]
    fn delete_token_passes_lower_checks() {
        let scopes = parse_scopes(&["delete"]).unwrap();

        assert_eq!(check_scope(&scopes, Scope::Read), Ok(()));
        assert_eq!(check_scope(&scopes, Scope::Write), Ok(()));
        assert_eq!(check_scope(&scopes, Scope::Delete), Ok(()));
        assert_eq!(
            check_scope(&scopes, Scope::Admin),
            Err(Denial::Missing(Scope::Admin))
        );
    }

    #[test]
    fn wildcard_grants_everything() {
        let scopes = parse_scopes(&["*"]).unwrap();
        assert_eq!(check_scope(&scopes, Scope::Admin), Ok(()));
    }

    #[test]
    fn malformed_lists() {
        let empty: [&str; 0] = [];
        assert_eq!(parse_scopes(&empty), Err(Denial::MalformedScopes));
        assert_eq!(
            parse_scopes(&["read", "everything"]),
            Err(Denial::MalformedScopes)
        );
        assert_eq!(check_scope(&[], Scope::Read), Err(Denial::MalformedScopes));
    }

    #[test]
    fn denial_names() {
        assert_eq!(Denial::Missing(Scope::Read).to_string(), "missing-read");
        assert_eq!(Denial::Missing(Scope::Admin).to_string(), "missing-admin");
        assert_eq!(Denial::MalformedScopes.to_string(), "malformed-scopes");
    }

    #[test]
    fn serde() {
        let scope: Scope = serde_json::from_str("\"delete\"").unwrap();
        assert_eq!(scope, Scope::Delete);
        assert_eq!(serde_json::to_string(&Scope::Write).unwrap(), "\"write\"");
    }
}
