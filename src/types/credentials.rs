//! Registry credential records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authentication mechanism for a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Basic,
    Token,
    Oauth,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthType::Basic => "basic",
            AuthType::Token => "token",
            AuthType::Oauth => "oauth",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(AuthType::Basic),
            "token" => Ok(AuthType::Token),
            "oauth" => Ok(AuthType::Oauth),
            other => Err(format!("unknown auth type: {}", other)),
        }
    }
}

/// Stored credentials for one registry
///
/// The `secret` field holds the sealed credential material; unsealing is the
/// job of the credentials store, not of code that merely passes records
/// around. Invariant: at most one record per `registry_url` has
/// `is_default = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredentials {
    /// Unique name of this record
    pub name: String,

    /// Registry base URL
    pub registry_url: String,

    pub auth_type: AuthType,

    /// Sealed secret material (basic: "user:password", token: the token)
    pub secret: String,

    /// Whether this record is the default for its registry_url
    pub is_default: bool,

    pub created_at: DateTime<Utc>,
}
