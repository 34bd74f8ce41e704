//! Single-use response tokens.
//!
//! A token is minted when a donor is notified and links the inbound
//! confirmation back to its (request, donor) pair. Tokens are generated from
//! the OS CSPRNG (uuid v4, 122 bits); uniqueness is enforced by the store at
//! insert time, not left to probability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::donor::DonorId;
use super::request::RequestId;
use crate::error::BloodlineError;

/// Opaque single-use credential carried in a donor's response link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseToken(pub Uuid);

impl ResponseToken {
    /// Mint a fresh token.
    pub fn mint() -> Self {
        ResponseToken(Uuid::new_v4())
    }
}

impl std::fmt::Display for ResponseToken {
    // Full value: tokens go into response URLs, not just logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ResponseToken {
    fn from(uuid: Uuid) -> Self {
        ResponseToken(uuid)
    }
}

impl std::str::FromStr for ResponseToken {
    type Err = BloodlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(ResponseToken)
            .map_err(|_| BloodlineError::TokenNotFound)
    }
}

/// Stored binding of a token to its (request, donor) pair.
///
/// Created at send time, never mutated except for the consumption mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: ResponseToken,
    pub request_id: RequestId,
    pub donor_id: DonorId,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the token is used to confirm.
    pub consumed_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn new(request_id: RequestId, donor_id: DonorId, now: DateTime<Utc>) -> Self {
        Self {
            token: ResponseToken::mint(),
            request_id,
            donor_id,
            created_at: now,
            consumed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parse_round_trip() {
        let token = ResponseToken::mint();
        let parsed: ResponseToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_token_parse_rejects_garbage() {
        assert!("not-a-token".parse::<ResponseToken>().is_err());
    }
}
