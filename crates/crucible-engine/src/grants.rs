//! Run-time grant evaluation.
//!
//! Candidates are checked in strict priority order — user rules before
//! role rules, exact model before provider wildcard before catch-all,
//! exact step kind before `*` — and the first matching row wins.

use crucible_store::{GrantEffect, GranteeKind, ModelGrant};

/// Result of evaluating the grant hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantDecision {
    pub allowed: bool,
    /// True iff some grant row matched. Without a match the caller's
    /// default policy applies.
    pub explicit: bool,
}

/// Provider prefix of a model id: everything up to the first `/`, empty
/// if there is none.
pub fn derive_provider(model_id: &str) -> &str {
    model_id.split_once('/').map(|(p, _)| p).unwrap_or("")
}

/// Evaluate `(user, role, model, step_kind)` against a grant set.
pub fn evaluate(
    user_id: &str,
    role: &str,
    model_id: &str,
    step_kind: &str,
    grants: &[ModelGrant],
) -> GrantDecision {
    let provider = derive_provider(model_id);
    let provider_wildcard = format!("{provider}/*");

    let mut candidates: Vec<(GranteeKind, &str, &str, &str)> = Vec::with_capacity(12);
    for (kind, grantee) in [(GranteeKind::User, user_id), (GranteeKind::Role, role)] {
        candidates.push((kind, grantee, model_id, step_kind));
        candidates.push((kind, grantee, model_id, "*"));
        if !provider.is_empty() {
            candidates.push((kind, grantee, provider_wildcard.as_str(), step_kind));
            candidates.push((kind, grantee, provider_wildcard.as_str(), "*"));
        }
        candidates.push((kind, grantee, "*", step_kind));
        candidates.push((kind, grantee, "*", "*"));
    }

    for (kind, grantee, model_pattern, step_pattern) in candidates {
        let matched = grants.iter().find(|g| {
            g.grantee_kind == kind
                && g.grantee_id == grantee
                && g.model == model_pattern
                && g.step_kind == step_pattern
        });
        if let Some(grant) = matched {
            return GrantDecision {
                allowed: grant.effect == GrantEffect::Allow,
                explicit: true,
            };
        }
    }

    GrantDecision {
        allowed: false,
        explicit: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(
        kind: GranteeKind,
        grantee: &str,
        model: &str,
        step_kind: &str,
        effect: GrantEffect,
    ) -> ModelGrant {
        ModelGrant {
            id: crucible_store::new_id(),
            grantee_kind: kind,
            grantee_id: grantee.to_string(),
            model: model.to_string(),
            step_kind: step_kind.to_string(),
            effect,
            created_by: "admin".into(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_derive_provider() {
        assert_eq!(derive_provider("vendor/m1"), "vendor");
        assert_eq!(derive_provider("bare"), "");
    }

    #[test]
    fn test_no_rules_is_implicit_deny() {
        let decision = evaluate("u", "operator", "vendor/m1", "llm", &[]);
        assert!(!decision.allowed);
        assert!(!decision.explicit);
    }

    #[test]
    fn test_user_rules_outrank_role_rules() {
        // User has a provider-wildcard allow; the role has an exact-model
        // deny. The user rule wins despite being less specific.
        let grants = vec![
            grant(
                GranteeKind::User,
                "u",
                "vendor/*",
                "*",
                GrantEffect::Allow,
            ),
            grant(
                GranteeKind::Role,
                "operator",
                "vendor/m1",
                "*",
                GrantEffect::Deny,
            ),
        ];
        let decision = evaluate("u", "operator", "vendor/m1", "llm", &grants);
        assert!(decision.allowed);
        assert!(decision.explicit);
    }

    #[test]
    fn test_exact_model_outranks_provider_wildcard() {
        let grants = vec![
            grant(
                GranteeKind::User,
                "u",
                "vendor/*",
                "*",
                GrantEffect::Allow,
            ),
            grant(
                GranteeKind::User,
                "u",
                "vendor/m1",
                "*",
                GrantEffect::Deny,
            ),
        ];
        let decision = evaluate("u", "operator", "vendor/m1", "llm", &grants);
        assert!(!decision.allowed);
        assert!(decision.explicit);
    }

    #[test]
    fn test_exact_step_kind_outranks_wildcard() {
        let grants = vec![
            grant(
                GranteeKind::User,
                "u",
                "vendor/m1",
                "*",
                GrantEffect::Allow,
            ),
            grant(
                GranteeKind::User,
                "u",
                "vendor/m1",
                "llm",
                GrantEffect::Deny,
            ),
        ];
        assert!(!evaluate("u", "operator", "vendor/m1", "llm", &grants).allowed);
        // Another step kind only sees the wildcard allow.
        assert!(evaluate("u", "operator", "vendor/m1", "check", &grants).allowed);
    }

    #[test]
    fn test_role_rules_apply_when_user_has_none() {
        let grants = vec![grant(
            GranteeKind::Role,
            "operator",
            "*",
            "*",
            GrantEffect::Allow,
        )];
        let decision = evaluate("u", "operator", "vendor/m1", "llm", &grants);
        assert!(decision.allowed);
        assert!(decision.explicit);
    }

    #[test]
    fn test_catch_all_deny() {
        let grants = vec![grant(GranteeKind::User, "u", "*", "*", GrantEffect::Deny)];
        let decision = evaluate("u", "operator", "anything", "sql", &grants);
        assert!(!decision.allowed);
        assert!(decision.explicit);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let grants = vec![
            grant(GranteeKind::User, "u", "vendor/*", "llm", GrantEffect::Deny),
            grant(GranteeKind::User, "u", "*", "*", GrantEffect::Allow),
        ];
        let first = evaluate("u", "operator", "vendor/m1", "llm", &grants);
        for _ in 0..10 {
            assert_eq!(evaluate("u", "operator", "vendor/m1", "llm", &grants), first);
        }
    }

    #[test]
    fn test_model_without_provider_skips_wildcard_levels() {
        // A bare model id must not accidentally match a "/*" pattern.
        let grants = vec![grant(GranteeKind::User, "u", "/*", "*", GrantEffect::Allow)];
        let decision = evaluate("u", "operator", "bare-model", "llm", &grants);
        assert!(!decision.explicit);
    }
}
