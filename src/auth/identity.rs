//! Verified caller identity.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::types::{SecretToken, SubjectId, TenantId};

/// Identity extracted from a validated inbound token.
///
/// Immutable once created. It lives for one request (or one session when a
/// caller reuses it) and is never persisted.
#[derive(Clone)]
pub struct UserIdentity {
    subject_id: SubjectId,
    principal_name: String,
    email: Option<String>,
    display_name: Option<String>,
    tenant_id: TenantId,
    groups: Vec<String>,
    roles: Vec<String>,
    claims: HashMap<String, Value>,
    token: SecretToken,
}

/// Log-safe view of a [`UserIdentity`]: no tokens, no raw claims.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub subject_id: String,
    pub principal_name: String,
    pub tenant_id: String,
    pub display_name: Option<String>,
    pub group_count: usize,
    pub roles: Vec<String>,
}

impl UserIdentity {
    /// Build an identity from a validated claim set.
    ///
    /// Returns the names of the required claims that are missing.
    pub fn from_claims(
        claims: HashMap<String, Value>,
        token: SecretToken,
    ) -> Result<Self, Vec<&'static str>> {
        let subject_id = claim_str(&claims, &["oid", "sub"]);
        let principal_name = claim_str(&claims, &["upn", "preferred_username", "unique_name"]);
        let tenant_id = claim_str(&claims, &["tid"]);

        let (subject_id, principal_name, tenant_id) = match (subject_id, principal_name, tenant_id)
        {
            (Some(s), Some(p), Some(t)) => (s, p, t),
            (s, p, t) => {
                let mut missing = Vec::new();
                if s.is_none() {
                    missing.push("oid/sub");
                }
                if p.is_none() {
                    missing.push("upn/preferred_username");
                }
                if t.is_none() {
                    missing.push("tid");
                }
                return Err(missing);
            }
        };

        Ok(Self {
            subject_id: SubjectId::new(subject_id),
            email: claim_str(&claims, &["email", "upn"]),
            display_name: claim_str(&claims, &["name"]),
            tenant_id: TenantId::new(tenant_id),
            groups: claim_list(&claims, "groups"),
            roles: claim_list(&claims, "roles"),
            principal_name,
            claims,
            token,
        })
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    pub fn principal_name(&self) -> &str {
        &self.principal_name
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// All claims of the validated token.
    pub fn claims(&self) -> &HashMap<String, Value> {
        &self.claims
    }

    /// The original inbound token, used as the exchange assertion.
    pub fn token(&self) -> &SecretToken {
        &self.token
    }

    /// Get a display-friendly name for this user.
    pub fn display(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.principal_name)
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            subject_id: self.subject_id.to_string(),
            principal_name: self.principal_name.clone(),
            tenant_id: self.tenant_id.to_string(),
            display_name: self.display_name.clone(),
            group_count: self.groups.len(),
            roles: self.roles.clone(),
        }
    }
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserIdentity")
            .field("subject_id", &self.subject_id)
            .field("principal_name", &self.principal_name)
            .field("tenant_id", &self.tenant_id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

fn claim_str(claims: &HashMap<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        claims
            .get(*name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn claim_list(claims: &HashMap<String, Value>, name: &str) -> Vec<String> {
    claims
        .get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_from_claims_prefers_oid_and_upn() {
        let identity = UserIdentity::from_claims(
            claims(json!({
                "oid": "object-1",
                "sub": "pairwise-sub",
                "upn": "alice@contoso.com",
                "preferred_username": "alice.other@contoso.com",
                "tid": "tenant-1",
                "name": "Alice",
                "groups": ["g1", "g2"],
                "roles": ["Reader"]
            })),
            SecretToken::new("inbound"),
        )
        .unwrap();

        assert_eq!(identity.subject_id().as_str(), "object-1");
        assert_eq!(identity.principal_name(), "alice@contoso.com");
        assert_eq!(identity.email(), Some("alice@contoso.com"));
        assert_eq!(identity.tenant_id().as_str(), "tenant-1");
        assert_eq!(identity.groups(), ["g1", "g2"]);
        assert_eq!(identity.roles(), ["Reader"]);
        assert_eq!(identity.display(), "Alice");
        assert_eq!(identity.token().expose(), "inbound");
    }

    #[test]
    fn test_from_claims_falls_back_to_sub_and_preferred_username() {
        let identity = UserIdentity::from_claims(
            claims(json!({
                "sub": "sub-1",
                "preferred_username": "bob@contoso.com",
                "tid": "tenant-1"
            })),
            SecretToken::new("inbound"),
        )
        .unwrap();

        assert_eq!(identity.subject_id().as_str(), "sub-1");
        assert_eq!(identity.principal_name(), "bob@contoso.com");
        assert_eq!(identity.display(), "bob@contoso.com");
        assert!(identity.groups().is_empty());
    }

    #[test]
    fn test_from_claims_reports_missing() {
        let missing = UserIdentity::from_claims(
            claims(json!({ "sub": "sub-1" })),
            SecretToken::new("inbound"),
        )
        .unwrap_err();

        assert_eq!(missing, vec!["upn/preferred_username", "tid"]);
    }

    #[test]
    fn test_debug_and_summary_hide_token() {
        let identity = UserIdentity::from_claims(
            claims(json!({ "sub": "s", "upn": "u@x", "tid": "t" })),
            SecretToken::new("super-secret-token"),
        )
        .unwrap();

        assert!(!format!("{:?}", identity).contains("super-secret-token"));
        let summary = serde_json::to_string(&identity.summary()).unwrap();
        assert!(!summary.contains("super-secret-token"));
        assert!(summary.contains("u@x"));
    }
}
