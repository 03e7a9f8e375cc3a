//! Partition key derivation.

/// Address used when the caller could not determine the remote address.
pub const UNKNOWN_ADDRESS: &str = "unknown-ip";

/// A key that identifies the entity being throttled.
///
/// Authenticated callers are throttled per user (`user:<id>`); everyone else
/// per remote address (`ip:<addr>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Derive the key from an identity hint and a remote address hint.
    ///
    /// A missing or empty identity is not an error: the key silently falls
    /// back to the remote address.
    pub fn resolve(identity: Option<&str>, remote_address: Option<&str>) -> Self {
        match identity.filter(|id| !id.is_empty()) {
            Some(id) => Self(format!("user:{}", id)),
            None => {
                let addr = remote_address
                    .filter(|addr| !addr.is_empty())
                    .unwrap_or(UNKNOWN_ADDRESS);
                Self(format!("ip:{}", addr))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick the identity hint from a caller's claims.
///
/// `precedence` lists claim types in order of preference; the first one with a
/// non-empty value wins. Claims are `(type, value)` pairs as they come off a
/// decoded token.
pub fn identity_from_claims<'a, T, V>(precedence: &[String], claims: &'a [(T, V)]) -> Option<&'a str>
where
    T: AsRef<str>,
    V: AsRef<str>,
{
    precedence.iter().find_map(|wanted| {
        claims
            .iter()
            .find(|(kind, value)| kind.as_ref() == wanted && !value.as_ref().is_empty())
            .map(|(_, value)| value.as_ref())
    })
}
