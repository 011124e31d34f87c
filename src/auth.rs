use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// A verified caller. Tokens are issued elsewhere; this crate only checks them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub user_id: String,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `None` means the token is unknown or expired.
    async fn verify(&self, token: &str) -> Option<Principal>;
}

/// Fixed token → user table, configured as `token=user` pairs.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn from_pairs(pairs: &[String]) -> Result<Self> {
        let mut tokens = HashMap::new();
        for pair in pairs {
            let Some((token, user)) = pair.split_once('=') else {
                bail!("invalid auth token entry (expected token=user)");
            };
            let (token, user) = (token.trim(), user.trim());
            if token.is_empty() || user.is_empty() {
                bail!("invalid auth token entry (token and user must be non-empty)");
            }
            tokens.insert(token.to_string(), user.to_string());
        }
        Ok(Self::new(tokens))
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token.trim()).map(|user_id| Principal {
            user_id: user_id.clone(),
        })
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_tokens_resolve_to_principals() {
        let verifier =
            StaticTokenVerifier::from_pairs(&["tok-a=alice".to_string(), " tok-b = bob ".to_string()])
                .expect("pairs should parse");
        assert_eq!(
            verifier.verify("tok-b").await,
            Some(Principal {
                user_id: "bob".to_string()
            })
        );
        assert_eq!(verifier.verify("nope").await, None);

        let err = StaticTokenVerifier::from_pairs(&["missing-separator".to_string()])
            .expect_err("entry without '=' should fail");
        assert!(!err.to_string().contains("missing-separator"));
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
