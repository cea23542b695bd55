use serde::{Deserialize, Serialize};

/// Claims carried by an inbound user JWT.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserClaims {
    pub sub: String, // User subject
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub exp: usize, // Expiration time (UNIX timestamp)
}
