/* ernie-gateway/src/auth.rs

Inbound authentication against the single configured master key.

- No master key configured: every request is let through (`Verification::Open`)
  and the caller is expected to log that loudly.
- Otherwise the request must carry `Authorization: Bearer <key>`:
  • header missing            -> Missing  (401)
  • not a Bearer credential   -> InvalidScheme (401)
  • wrong key                 -> Forbidden (403)

*/

#![forbid(unsafe_code)]

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Open,
    Valid,
    Missing,
    InvalidScheme,
    Forbidden,
}

impl Verification {
    pub fn into_result(self) -> Result<(), GatewayError> {
        match self {
            Verification::Open | Verification::Valid => Ok(()),
            Verification::Missing => Err(GatewayError::Unauthorized(
                "Unauthorized: Missing Authorization header.".into(),
            )),
            Verification::InvalidScheme => Err(GatewayError::Unauthorized(
                "Invalid authentication scheme. Use 'Bearer <your_api_key>'.".into(),
            )),
            Verification::Forbidden => {
                Err(GatewayError::Forbidden("Forbidden: Invalid API Key.".into()))
            }
        }
    }
}

/// Check an `Authorization` header value against the master key.
pub fn verify_bearer(master_key: Option<&str>, auth_header: Option<&str>) -> Verification {
    let Some(expected) = master_key else {
        return Verification::Open;
    };
    let Some(raw) = auth_header else {
        return Verification::Missing;
    };
    let Some(token) = parse_bearer(raw) else {
        return Verification::InvalidScheme;
    };
    if ct_eq(token.as_bytes(), expected.as_bytes()) {
        Verification::Valid
    } else {
        Verification::Forbidden
    }
}

/// Extract the token from `Bearer <token>`; the scheme is case-insensitive
/// and exactly one token must follow it.
fn parse_bearer(raw: &str) -> Option<&str> {
    let mut parts = raw.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
