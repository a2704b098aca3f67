//! Secret stores, scoped resolution and output redaction
//!
//! Secrets are looked up lazily, one name at a time, only after the scope
//! check passes. Every value handed out for a job is registered with that
//! job's [`Redactor`] so it can be masked out of captured output.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::engine::error::StepError;

/// Replacement text for masked secret values
pub const REDACTED: &str = "***";

/// An opaque secret value. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for injection into a step only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue({})", REDACTED)
    }
}

/// A stored secret with an optional store-side scope
#[derive(Debug, Clone)]
pub struct Secret {
    pub value: SecretValue,
    /// Job ids allowed to read this secret; `None` means any job that declares it
    pub scope: Option<BTreeSet<String>>,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: SecretValue::new(value),
            scope: None,
        }
    }

    pub fn scoped<I, S>(value: impl Into<String>, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            value: SecretValue::new(value),
            scope: Some(jobs.into_iter().map(Into::into).collect()),
        }
    }

    pub fn allows(&self, job: &str) -> bool {
        self.scope.as_ref().map_or(true, |jobs| jobs.contains(job))
    }
}

/// Key lookup into an external secure store
pub trait SecretStore: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Secret>;
}

/// In-memory store, also the result of loading a secrets file
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<String, Secret>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(name.into(), Secret::new(value));
    }

    pub fn insert_secret(&mut self, name: impl Into<String>, secret: Secret) {
        self.secrets.insert(name.into(), secret);
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Load a YAML secrets file:
    ///
    /// ```yaml
    /// NPM_TOKEN: npm_abc
    /// KUBE_CONFIG:
    ///   value: "apiVersion: v1 ..."
    ///   scope: [deploy]
    /// ```
    pub fn load_file(path: &Path) -> Result<Self, SecretFileError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Entry {
            Plain(String),
            Full {
                value: String,
                #[serde(default)]
                scope: Option<Vec<String>>,
            },
        }

        let content = std::fs::read_to_string(path).map_err(|error| SecretFileError::Io {
            file: path.display().to_string(),
            error,
        })?;
        let entries: HashMap<String, Entry> =
            serde_yaml::from_str(&content).map_err(|error| SecretFileError::Yaml {
                file: path.display().to_string(),
                error,
            })?;

        let secrets = entries
            .into_iter()
            .map(|(name, entry)| {
                let secret = match entry {
                    Entry::Plain(value) => Secret::new(value),
                    Entry::Full { value, scope: None } => Secret::new(value),
                    Entry::Full {
                        value,
                        scope: Some(jobs),
                    } => Secret::scoped(value, jobs),
                };
                (name, secret)
            })
            .collect();

        Ok(Self { secrets })
    }
}

impl SecretStore for MemorySecretStore {
    fn lookup(&self, name: &str) -> Option<Secret> {
        self.secrets.get(name).cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretFileError {
    #[error("IO error reading {file}: {error}")]
    Io {
        file: String,
        error: std::io::Error,
    },

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },
}

/// Reads `NAME` from the process variable `<prefix>NAME`
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl SecretStore for EnvSecretStore {
    fn lookup(&self, name: &str) -> Option<Secret> {
        std::env::var(format!("{}{}", self.prefix, name))
            .ok()
            .map(Secret::new)
    }
}

/// Tries several stores in order; the first hit wins
#[derive(Default, Clone)]
pub struct ChainedSecretStore {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl ChainedSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, store: Arc<dyn SecretStore>) {
        self.stores.push(store);
    }
}

impl SecretStore for ChainedSecretStore {
    fn lookup(&self, name: &str) -> Option<Secret> {
        self.stores.iter().find_map(|store| store.lookup(name))
    }
}

/// Scoped, read-only access to a secret store
///
/// Shared across concurrently running jobs without locking.
#[derive(Clone)]
pub struct SecretProvider {
    store: Arc<dyn SecretStore>,
}

impl SecretProvider {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Resolve `name` on behalf of `job`, which declared `declared` secrets.
    ///
    /// The store is not consulted for undeclared names.
    pub fn resolve(
        &self,
        job: &str,
        declared: &[String],
        name: &str,
    ) -> Result<SecretValue, StepError> {
        if !declared.iter().any(|d| d == name) {
            return Err(StepError::ScopeViolation {
                job: job.to_string(),
                name: name.to_string(),
            });
        }

        let secret = self
            .store
            .lookup(name)
            .ok_or_else(|| StepError::SecretNotFound {
                name: name.to_string(),
            })?;

        if !secret.allows(job) {
            return Err(StepError::ScopeViolation {
                job: job.to_string(),
                name: name.to_string(),
            });
        }

        Ok(secret.value)
    }
}

impl fmt::Debug for SecretProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretProvider").finish_non_exhaustive()
    }
}

/// Masks known secret values in text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    // Longest first so overlapping values are fully masked
    values: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to mask. Multi-line values are also masked line by line.
    pub fn add(&mut self, value: &SecretValue) {
        let raw = value.expose();
        let mut candidates = vec![raw.to_string()];
        if raw.contains('\n') {
            candidates.extend(
                raw.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
        }

        for candidate in candidates {
            if !candidate.is_empty() && !self.values.contains(&candidate) {
                self.values.push(candidate);
            }
        }
        self.values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        out
    }

    pub fn redact_error(&self, error: StepError) -> StepError {
        error.map_messages(|message| self.redact(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> SecretProvider {
        let mut store = MemorySecretStore::new();
        store.insert("NPM_TOKEN", "npm_s3cr3t");
        store.insert_secret("KUBE_CONFIG", Secret::scoped("kube-data", ["deploy"]));
        SecretProvider::new(Arc::new(store))
    }

    fn declared(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_in_scope() {
        let value = provider()
            .resolve("build", &declared(&["NPM_TOKEN"]), "NPM_TOKEN")
            .unwrap();
        assert_eq!(value.expose(), "npm_s3cr3t");
    }

    #[test]
    fn test_undeclared_secret_is_scope_violation() {
        let err = provider().resolve("build", &[], "NPM_TOKEN").unwrap_err();
        assert_eq!(
            err,
            StepError::ScopeViolation {
                job: "build".to_string(),
                name: "NPM_TOKEN".to_string()
            }
        );
    }

    #[test]
    fn test_store_scope_excludes_job() {
        let err = provider()
            .resolve("build", &declared(&["KUBE_CONFIG"]), "KUBE_CONFIG")
            .unwrap_err();
        assert!(matches!(err, StepError::ScopeViolation { .. }));

        let ok = provider().resolve("deploy", &declared(&["KUBE_CONFIG"]), "KUBE_CONFIG");
        assert!(ok.is_ok());
    }

    #[test]
    fn test_missing_secret() {
        let err = provider()
            .resolve("build", &declared(&["MISSING"]), "MISSING")
            .unwrap_err();
        assert!(matches!(err, StepError::SecretNotFound { .. }));
    }

    #[test]
    fn test_debug_hides_value() {
        let value = SecretValue::new("hunter2");
        assert!(!format!("{:?}", value).contains("hunter2"));
    }

    #[test]
    fn test_redactor() {
        let mut redactor = Redactor::new();
        redactor.add(&SecretValue::new("abc"));
        redactor.add(&SecretValue::new("abcdef"));
        redactor.add(&SecretValue::new("line-one\nline-two"));

        assert_eq!(redactor.redact("token=abcdef;short=abc"), "token=***;short=***");
        assert_eq!(redactor.redact("got line-two only"), "got *** only");
        assert_eq!(redactor.redact("nothing here"), "nothing here");
    }

    #[test]
    fn test_redact_error_messages() {
        let mut redactor = Redactor::new();
        redactor.add(&SecretValue::new("pw123"));

        let err = redactor.redact_error(StepError::Execution {
            exit_code: 1,
            message: "login failed for pw123".to_string(),
        });
        assert_eq!(
            err,
            StepError::Execution {
                exit_code: 1,
                message: "login failed for ***".to_string()
            }
        );
    }

    #[test]
    fn test_chained_store() {
        let mut chain = ChainedSecretStore::new();
        chain.push(Arc::new(MemorySecretStore::new().with("A", "from-first")));
        chain.push(Arc::new(
            MemorySecretStore::new().with("A", "shadowed").with("B", "from-second"),
        ));

        assert_eq!(chain.lookup("A").unwrap().value.expose(), "from-first");
        assert_eq!(chain.lookup("B").unwrap().value.expose(), "from-second");
        assert!(chain.lookup("C").is_none());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");
        std::fs::write(
            &path,
            "NPM_TOKEN: abc\nKUBE_CONFIG:\n  value: kube\n  scope: [deploy]\n",
        )
        .unwrap();

        let store = MemorySecretStore::load_file(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.lookup("KUBE_CONFIG").unwrap().allows("deploy"));
        assert!(!store.lookup("KUBE_CONFIG").unwrap().allows("build"));
    }
}
