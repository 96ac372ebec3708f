//! Ephemeral master credentials
//!
//! A credential lives only in memory for the duration of one run. It is not
//! serializable, and its `Debug`/`Display` output is redacted so it cannot
//! leak through logs or error messages.

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rds_sanitizer_common::CredentialPolicy;

const REDACTED: &str = "<redacted>";

#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Generate a random alphanumeric secret satisfying `policy`
    ///
    /// Alphanumerics avoid every character RDS forbids in master passwords;
    /// at least one lowercase letter, uppercase letter and digit is
    /// guaranteed.
    pub fn generate(policy: &CredentialPolicy) -> Self {
        loop {
            let secret: String = OsRng
                .sample_iter(&Alphanumeric)
                .take(policy.length)
                .map(char::from)
                .collect();
            let has_lower = secret.chars().any(|c| c.is_ascii_lowercase());
            let has_upper = secret.chars().any(|c| c.is_ascii_uppercase());
            let has_digit = secret.chars().any(|c| c.is_ascii_digit());
            if has_lower && has_upper && has_digit && policy.allows(&secret) {
                return Self(secret);
            }
        }
    }

    /// The secret itself; only for handing to the control plane and sanitizer
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential").field(&REDACTED).finish()
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

#[cfg(test)]
impl From<&str> for Credential {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rds_sanitizer_common::EngineKind;

    #[test]
    fn test_generated_credentials_follow_engine_policy() {
        for engine in [EngineKind::Postgres, EngineKind::MySql, EngineKind::MariaDb] {
            let policy = engine.credential_policy();
            let credential = Credential::generate(&policy);
            assert_eq!(credential.expose().len(), policy.length);
            assert!(policy.allows(credential.expose()), "{engine}");
        }
    }

    #[test]
    fn test_credentials_are_unique() {
        let policy = EngineKind::Postgres.credential_policy();
        assert_ne!(Credential::generate(&policy), Credential::generate(&policy));
    }

    #[test]
    fn test_debug_and_display_are_redacted() {
        let credential = Credential::from("hunter2hunter2");
        assert_eq!(format!("{credential}"), "<redacted>");
        assert!(!format!("{credential:?}").contains("hunter2"));
    }
}
