//! Sources of registry user name and password

use crate::error::*;
use serde::Deserialize;
use std::{collections::HashMap, fs, io, path::*, sync::Mutex};

/// Environment variable of the registry user name
pub const USERNAME_ENV: &str = "OCIVM_REGISTRY_USERNAME";
/// Environment variable of the registry password
pub const PASSWORD_ENV: &str = "OCIVM_REGISTRY_PASSWORD";
/// Restrict the environment credentials to a single registry host
pub const HOST_ENV: &str = "OCIVM_REGISTRY_HOST";
/// Docker config JSON given inline, takes precedence over `~/.docker/config.json`
pub const DOCKER_AUTH_CONFIG_ENV: &str = "DOCKER_AUTH_CONFIG";

/// Looks up `(user, password)` for a registry host
///
/// Shared by all concurrent requests of a client.
pub trait CredentialsProvider: Send + Sync {
    /// `None` when this provider knows nothing about the host
    fn retrieve(&self, host: &str) -> Result<Option<(String, String)>>;

    /// Remember credentials for later use, read-only providers ignore this
    fn store(&self, _host: &str, _user: &str, _password: &str) -> Result<()> {
        Ok(())
    }
}

/// Credentials from `OCIVM_REGISTRY_USERNAME` and `OCIVM_REGISTRY_PASSWORD`
#[derive(Debug, Clone, Default)]
pub struct EnvironmentCredentials;

impl CredentialsProvider for EnvironmentCredentials {
    fn retrieve(&self, host: &str) -> Result<Option<(String, String)>> {
        if let Ok(expected) = std::env::var(HOST_ENV) {
            if expected != host {
                return Ok(None);
            }
        }
        match (std::env::var(USERNAME_ENV), std::env::var(PASSWORD_ENV)) {
            (Ok(user), Ok(password)) => Ok(Some((user, password))),
            _ => Ok(None),
        }
    }
}

/// Credentials stored by `docker login`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfigCredentials {
    #[serde(default)]
    auths: HashMap<String, Auth>,
}

#[derive(Debug, Clone, Deserialize)]
struct Auth {
    auth: Option<String>,
}

impl DockerConfigCredentials {
    /// Load from `$DOCKER_AUTH_CONFIG`, or `~/.docker/config.json` merged with podman's `auth.json`
    pub fn load() -> Result<Self> {
        if let Ok(inline) = std::env::var(DOCKER_AUTH_CONFIG_ENV) {
            return Self::from_json(inline.as_bytes());
        }
        let mut creds = Self::default();
        for path in [docker_auth_path(), podman_auth_path()].into_iter().flatten() {
            if let Ok(new) = Self::from_path(&path) {
                creds.append(new);
            }
        }
        Ok(creds)
    }

    pub fn from_json(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        if path.is_file() {
            let f = fs::File::open(path)?;
            Ok(serde_json::from_reader(io::BufReader::new(f))?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn append(&mut self, other: Self) {
        self.auths.extend(other.auths);
    }
}

impl CredentialsProvider for DockerConfigCredentials {
    fn retrieve(&self, host: &str) -> Result<Option<(String, String)>> {
        let auth = self
            .auths
            .get(host)
            .or_else(|| self.auths.get(&format!("https://{}", host)))
            .and_then(|auth| auth.auth.as_ref());
        let encoded = match auth {
            Some(encoded) => encoded,
            None => return Ok(None),
        };
        let decoded = base64::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        match decoded.as_deref().and_then(|s| s.split_once(':')) {
            Some((user, password)) => Ok(Some((user.to_string(), password.to_string()))),
            None => {
                log::warn!("Ignoring malformed docker credentials for {}", host);
                Ok(None)
            }
        }
    }
}

/// In-memory credentials, e.g. given on the command line
#[derive(Debug, Default)]
pub struct StaticCredentials {
    /// Used for hosts without their own entry
    fallback: Option<(String, String)>,
    by_host: Mutex<HashMap<String, (String, String)>>,
}

impl StaticCredentials {
    /// Same credentials for every host
    pub fn new(user: &str, password: &str) -> Self {
        StaticCredentials {
            fallback: Some((user.to_string(), password.to_string())),
            by_host: Mutex::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, String)>> {
        self.by_host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialsProvider for StaticCredentials {
    fn retrieve(&self, host: &str) -> Result<Option<(String, String)>> {
        Ok(self.lock().get(host).cloned().or_else(|| self.fallback.clone()))
    }

    fn store(&self, host: &str, user: &str, password: &str) -> Result<()> {
        self.lock()
            .insert(host.to_string(), (user.to_string(), password.to_string()));
        Ok(())
    }
}

/// Asks each provider in turn, first answer wins
#[derive(Default)]
pub struct CredentialsChain {
    providers: Vec<Box<dyn CredentialsProvider>>,
}

impl CredentialsChain {
    pub fn new(providers: Vec<Box<dyn CredentialsProvider>>) -> Self {
        CredentialsChain { providers }
    }

    /// Environment variables first, then docker config
    pub fn standard() -> Result<Self> {
        Ok(Self::new(vec![
            Box::new(EnvironmentCredentials),
            Box::new(DockerConfigCredentials::load()?),
        ]))
    }
}

impl CredentialsProvider for CredentialsChain {
    fn retrieve(&self, host: &str) -> Result<Option<(String, String)>> {
        for provider in &self.providers {
            if let Some(creds) = provider.retrieve(host)? {
                return Ok(Some(creds));
            }
        }
        Ok(None)
    }
}

fn docker_auth_path() -> Option<PathBuf> {
    let dirs = directories::BaseDirs::new()?;
    Some(dirs.home_dir().join(".docker/config.json"))
}

fn podman_auth_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "containers")?;
    Some(dirs.runtime_dir()?.join("auth.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_config() -> Result<()> {
        let creds = DockerConfigCredentials::from_json(
            br#"{"auths": {"ghcr.io": {"auth": "dXNlcjpwYXNz"}, "broken.io": {"auth": "!!!"}, "empty.io": {}}}"#,
        )?;
        assert_eq!(
            creds.retrieve("ghcr.io")?,
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(creds.retrieve("docker.io")?, None);
        assert_eq!(creds.retrieve("broken.io")?, None);
        assert_eq!(creds.retrieve("empty.io")?, None);
        Ok(())
    }

    #[test]
    fn docker_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        assert!(DockerConfigCredentials::from_path(&path)?.auths.is_empty());
        fs::write(&path, r#"{"auths": {"https://index.docker.io": {"auth": "YTpiOmM="}}}"#)?;
        let creds = DockerConfigCredentials::from_path(&path)?;
        // Password may contain ':'
        assert_eq!(
            creds.retrieve("index.docker.io")?,
            Some(("a".to_string(), "b:c".to_string()))
        );
        Ok(())
    }

    #[test]
    fn chain_order() -> Result<()> {
        let chain = CredentialsChain::new(vec![
            Box::new(DockerConfigCredentials::from_json(
                br#"{"auths": {"ghcr.io": {"auth": "dXNlcjpwYXNz"}}}"#,
            )?),
            Box::new(StaticCredentials::new("fallback", "secret")),
        ]);
        assert_eq!(chain.retrieve("ghcr.io")?.map(|c| c.0), Some("user".to_string()));
        assert_eq!(chain.retrieve("quay.io")?.map(|c| c.0), Some("fallback".to_string()));
        assert_eq!(CredentialsChain::default().retrieve("quay.io")?, None);
        Ok(())
    }

    #[test]
    fn static_store() -> Result<()> {
        let creds = StaticCredentials::default();
        assert_eq!(creds.retrieve("ghcr.io")?, None);
        creds.store("ghcr.io", "me", "pw")?;
        assert_eq!(
            creds.retrieve("ghcr.io")?,
            Some(("me".to_string(), "pw".to_string()))
        );
        assert_eq!(creds.retrieve("quay.io")?, None);
        Ok(())
    }
}
