use crate::errors::{Error, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADMIN_GROUP: &str = "farmAdmin";
pub const DEFAULT_TEMPORARY_GROUP: &str = "tempViewer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Temporary,
    Unknown,
}

/// Verified claims of an authenticated session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "cognito:groups")]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub role: Role,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GroupNames {
    pub admin: String,
    pub temporary: String,
}

impl Default for GroupNames {
    fn default() -> Self {
        Self {
            admin: DEFAULT_ADMIN_GROUP.to_string(),
            temporary: DEFAULT_TEMPORARY_GROUP.to_string(),
        }
    }
}

/// Turns verified claims into a caller identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    groups: GroupNames,
}

impl IdentityResolver {
    pub fn new(groups: GroupNames) -> Self {
        Self { groups }
    }

    pub fn resolve(&self, claims: &Claims) -> Result<CallerIdentity> {
        let user_id = claims
            .sub
            .as_deref()
            .map(str::trim)
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| Error::Auth("Claims carry no subject".to_string()))?;

        // Admin wins when a caller is in both groups
        let role = if claims.groups.iter().any(|g| g == &self.groups.admin) {
            Role::Admin
        } else if claims.groups.iter().any(|g| g == &self.groups.temporary) {
            Role::Temporary
        } else {
            Role::Unknown
        };

        Ok(CallerIdentity {
            user_id: user_id.to_string(),
            role,
            groups: claims.groups.clone(),
        })
    }
}

/// Verifies HS256 bearer tokens issued by the identity provider.
pub struct ClaimsVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl ClaimsVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Auth(format!("Invalid token: {}", e)))
    }

    /// Accepts a raw `Authorization` header value.
    pub fn verify_header(&self, header: &str) -> Result<Claims> {
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| {
                Error::Auth("Invalid authorization format, expected 'Bearer <token>'".to_string())
            })?;
        self.verify(token.trim())
    }
}
