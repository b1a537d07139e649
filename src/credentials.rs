//! Signing secret loading from the environment or a private `.env` file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use crate::config::SigningConfig;
use crate::proof::signing::{Attestor, Keyring, SigningKey};

/// Key-value pairs read from a `.env` file.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a key-value map.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Value for `key`, if present and non-blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Load a `.env` file. The file must not be readable by group or others.
///
/// # Errors
///
/// Returns an error if the file does not exist, permissions are too broad,
/// or parsing fails.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "credentials file does not exist: {}",
            path.display()
        ));
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;
    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        vars.insert(key, value);
    }

    Ok(Credentials { vars })
}

/// Resolve the secret stored under `var`.
///
/// The process environment wins; `env_file` is consulted only when the
/// variable is unset. Base64 values are decoded, anything else is used as
/// raw bytes.
///
/// # Errors
///
/// Returns an error if neither source provides the variable or the `.env`
/// file is invalid.
pub fn load_signing_secret(var: &str, env_file: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    let value = match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            debug!(var, "signing secret read from environment");
            value
        }
        _ => {
            let path = env_file
                .ok_or_else(|| anyhow::anyhow!("signing secret {var} is not set"))?;
            let credentials = load_credentials(path)?;
            let value = credentials.get(var).ok_or_else(|| {
                anyhow::anyhow!("signing secret {var} missing from {}", path.display())
            })?;
            debug!(var, path = %path.display(), "signing secret read from env file");
            value.to_owned()
        }
    };
    Ok(decode_secret(value.trim()))
}

fn decode_secret(value: &str) -> Vec<u8> {
    BASE64
        .decode(value)
        .unwrap_or_else(|_| value.as_bytes().to_vec())
}

/// Build the process attestor and the keyring of every trusted authority.
///
/// # Errors
///
/// Returns an error if any configured secret is missing or too short.
pub fn load_signing_keys(config: &SigningConfig) -> anyhow::Result<(Attestor, Keyring)> {
    let env_file = config.env_file.as_deref();
    let secret = load_signing_secret(&config.secret_env, env_file)?;
    let key = SigningKey::new(&config.authority, secret)
        .with_context(|| format!("invalid signing key for {}", config.authority))?;
    let attestor = Attestor::new(config.authority.clone(), key);

    let mut keyring = attestor.keyring();
    for trusted in &config.trusted {
        let secret = load_signing_secret(&trusted.secret_env, env_file)?;
        let key = SigningKey::new(&trusted.authority, secret)
            .with_context(|| format!("invalid signing key for {}", trusted.authority))?;
        keyring.insert(trusted.authority.clone(), key);
    }
    Ok((attestor, keyring))
}

/// Set owner-only permissions on `path` where supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect credentials file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(anyhow::anyhow!(
            "credentials file {} must be 0600, found {:o}",
            path.display(),
            mode
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
