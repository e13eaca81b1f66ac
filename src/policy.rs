//! Access policy collaborator.
//!
//! Rule evaluation is consumed as an allow/deny + PII-mask-flag oracle.
//! When a policy file is configured, visibility is deny-by-default: a
//! path is visible only if an allow rule matches and no deny rule does.
//! Without a configured policy everything is visible and unmasked.
//!
//! The shipped implementation reads glob rules from a TOML file:
//!
//! ```toml
//! allow = ["/home/docs/**", "C:/Work/**"]
//! deny = ["**/secrets/**"]
//! mask_pii = ["**/hr/**"]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

/// Allow/deny + PII-mask-flag oracle consumed by the pipeline.
pub trait AccessPolicy: Send + Sync {
    /// Whether `path` is visible. `agent` scopes multi-agent policies;
    /// `include_manual` also honors per-path manual grants. Both are
    /// accepted by every oracle even when unused.
    fn allows(&self, path: &str, agent: Option<&str>, include_manual: bool) -> bool;

    /// Whether extracted text for `path` must be PII-masked before use.
    fn pii_mask_enabled_for_path(&self, path: &str, agent: Option<&str>) -> bool;
}

/// Policy used when no policy file is configured: everything visible,
/// nothing masked.
pub struct AllowAllPolicy;

impl AccessPolicy for AllowAllPolicy {
    fn allows(&self, _path: &str, _agent: Option<&str>, _include_manual: bool) -> bool {
        true
    }

    fn pii_mask_enabled_for_path(&self, _path: &str, _agent: Option<&str>) -> bool {
        false
    }
}

#[derive(Debug, Deserialize, Default)]
struct PolicyFile {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
    #[serde(default)]
    mask_pii: Vec<String>,
}

/// Glob-rule policy loaded from a TOML file. Deny-by-default: paths not
/// matching any allow rule are invisible.
pub struct GlobPolicy {
    allow: GlobSet,
    deny: GlobSet,
    mask_pii: GlobSet,
}

impl GlobPolicy {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        let parsed: PolicyFile = toml::from_str(&raw)
            .with_context(|| format!("parsing policy file {}", path.display()))?;
        Ok(Self {
            allow: build_globset(&parsed.allow)?,
            deny: build_globset(&parsed.deny)?,
            mask_pii: build_globset(&parsed.mask_pii)?,
        })
    }
}

impl AccessPolicy for GlobPolicy {
    fn allows(&self, path: &str, _agent: Option<&str>, _include_manual: bool) -> bool {
        self.allow.is_match(path) && !self.deny.is_match(path)
    }

    fn pii_mask_enabled_for_path(&self, path: &str, _agent: Option<&str>) -> bool {
        self.mask_pii.is_match(path)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_policy(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn deny_by_default_when_configured() {
        let tmp = TempDir::new().unwrap();
        let path = write_policy(&tmp, r#"allow = ["/docs/**"]"#);
        let policy = GlobPolicy::load(&path).unwrap();
        assert!(policy.allows("/docs/a.pdf", None, true));
        assert!(!policy.allows("/elsewhere/a.pdf", None, true));
    }

    #[test]
    fn deny_overrides_allow() {
        let tmp = TempDir::new().unwrap();
        let path = write_policy(
            &tmp,
            r#"
            allow = ["/docs/**"]
            deny = ["/docs/secrets/**"]
            "#,
        );
        let policy = GlobPolicy::load(&path).unwrap();
        assert!(policy.allows("/docs/open.pdf", None, true));
        assert!(!policy.allows("/docs/secrets/keys.txt", None, true));
    }

    #[test]
    fn mask_flag_follows_globs() {
        let tmp = TempDir::new().unwrap();
        let path = write_policy(
            &tmp,
            r#"
            allow = ["/docs/**"]
            mask_pii = ["/docs/hr/**"]
            "#,
        );
        let policy = GlobPolicy::load(&path).unwrap();
        assert!(policy.pii_mask_enabled_for_path("/docs/hr/연봉.xlsx", None));
        assert!(!policy.pii_mask_enabled_for_path("/docs/plan.md", None));
    }

    #[test]
    fn unparsable_policy_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_policy(&tmp, "allow = [not toml");
        assert!(GlobPolicy::load(&path).is_err());
    }

    #[test]
    fn allow_all_is_wide_open() {
        assert!(AllowAllPolicy.allows("/anything", None, false));
        assert!(!AllowAllPolicy.pii_mask_enabled_for_path("/anything", None));
    }
}
