//! Confirmation gate for destructive operations. A caller must opt into force mode
//! and echo back a token naming the operation it is about to run.

use osmigrate_core::{MigrateError, Result};
use uuid::Uuid;

pub const TOKEN_PREFIX: &str = "OSM-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructiveOp {
    Migrate,
    Restore,
    PartitionCreate,
    PartitionDelete,
    PartitionResize,
    PartitionFormat,
    BootRemove,
    BackupDelete,
    BackupPrune,
}

impl DestructiveOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestructiveOp::Migrate => "MIGRATE",
            DestructiveOp::Restore => "RESTORE",
            DestructiveOp::PartitionCreate => "PCREATE",
            DestructiveOp::PartitionDelete => "PDELETE",
            DestructiveOp::PartitionResize => "PRESIZE",
            DestructiveOp::PartitionFormat => "PFORMAT",
            DestructiveOp::BootRemove => "BOOTRM",
            DestructiveOp::BackupDelete => "BKDELETE",
            DestructiveOp::BackupPrune => "BKPRUNE",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SafetyContext {
    pub force_mode: bool,
    pub confirmation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

impl SafetyDecision {
    pub fn into_result(self) -> Result<()> {
        match self {
            SafetyDecision::Allow => Ok(()),
            SafetyDecision::Deny(reason) => Err(MigrateError::validation(reason)),
        }
    }
}

/// Fresh token for `op`, e.g. `OSM-PFORMAT-3f2a9c1e`.
pub fn issue_confirmation_token(op: DestructiveOp) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}{}-{}", TOKEN_PREFIX, op.as_str(), &id[..8])
}

pub fn check_destructive(ctx: &SafetyContext, op: DestructiveOp) -> SafetyDecision {
    if !ctx.force_mode {
        return SafetyDecision::Deny("Denied: destructive ops require force-mode".to_string());
    }

    let Some(token) = &ctx.confirmation_token else {
        return SafetyDecision::Deny("Denied: confirmation token missing".to_string());
    };
    let Some(rest) = token.strip_prefix(TOKEN_PREFIX) else {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    };
    let Some((scope, nonce)) = rest.split_once('-') else {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    };
    if scope != op.as_str() {
        return SafetyDecision::Deny(format!(
            "Denied: confirmation token is for {}, not {}",
            scope,
            op.as_str()
        ));
    }
    if nonce.len() != 8 || !nonce.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    }

    SafetyDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(force_mode: bool, token: Option<&str>) -> SafetyContext {
        SafetyContext {
            force_mode,
            confirmation_token: token.map(str::to_string),
        }
    }

    #[test]
    fn denies_without_force() {
        let token = issue_confirmation_token(DestructiveOp::Migrate);
        assert!(matches!(
            check_destructive(&ctx(false, Some(&token)), DestructiveOp::Migrate),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn denies_without_token() {
        assert!(matches!(
            check_destructive(&ctx(true, None), DestructiveOp::Restore),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn denies_malformed_token() {
        for token in ["BAD", "OSM-", "OSM-MIGRATE", "OSM-MIGRATE-xyz", "ABC-MIGRATE-0123abcd"] {
            assert!(matches!(
                check_destructive(&ctx(true, Some(token)), DestructiveOp::Migrate),
                SafetyDecision::Deny(_)
            ));
        }
    }

    #[test]
    fn token_is_scoped_to_operation() {
        let token = issue_confirmation_token(DestructiveOp::PartitionFormat);
        let decision = check_destructive(&ctx(true, Some(&token)), DestructiveOp::PartitionDelete);
        assert!(matches!(decision, SafetyDecision::Deny(ref reason) if reason.contains("PFORMAT")));
        assert!(decision.into_result().is_err());
    }

    #[test]
    fn allows_issued_token() {
        let token = issue_confirmation_token(DestructiveOp::PartitionFormat);
        assert!(token.starts_with("OSM-PFORMAT-"));
        assert_eq!(
            check_destructive(&ctx(true, Some(&token)), DestructiveOp::PartitionFormat),
            SafetyDecision::Allow
        );
    }
}
