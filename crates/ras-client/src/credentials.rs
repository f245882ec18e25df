//! Paired credentials and where they live.
//!
//! Platforms plug their keychain or keystore in through
//! [`CredentialRepository`]. The CLI keeps them in a JSON file.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ras_common::Error;
use ras_crypto::MasterSecret;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// What pairing leaves behind. `Debug` never shows the secret.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Identifier the daemon assigned during pairing.
    pub device_id: String,
    pub master_secret: MasterSecret,
    /// Daemon HTTP/LAN endpoint, if one was advertised.
    pub daemon_host: Option<String>,
    pub daemon_port: Option<u16>,
    /// Daemon's VPN overlay address, if it has one.
    pub overlay_address: Option<IpAddr>,
}

impl Credentials {
    pub fn new(device_id: impl Into<String>, master_secret: MasterSecret) -> Self {
        Self {
            device_id: device_id.into(),
            master_secret,
            daemon_host: None,
            daemon_port: None,
            overlay_address: None,
        }
    }
}

pub trait CredentialRepository: Send + Sync {
    fn has_credentials(&self) -> bool;
    fn get_credentials(&self) -> Option<Credentials>;
    fn store_credentials(&self, credentials: Credentials) -> ras_common::Result<()>;
    fn clear_credentials(&self) -> ras_common::Result<()>;
}

/// Process-local repository, used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryCredentialRepository {
    inner: Mutex<Option<Credentials>>,
}

impl InMemoryCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            inner: Mutex::new(Some(credentials)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Credentials>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialRepository for InMemoryCredentialRepository {
    fn has_credentials(&self) -> bool {
        self.slot().is_some()
    }

    fn get_credentials(&self) -> Option<Credentials> {
        self.slot().clone()
    }

    fn store_credentials(&self, credentials: Credentials) -> ras_common::Result<()> {
        *self.slot() = Some(credentials);
        Ok(())
    }

    fn clear_credentials(&self) -> ras_common::Result<()> {
        // Dropping the old value zeroizes its secret.
        self.slot().take();
        Ok(())
    }
}

/// On-disk form. The hex secret is wiped when this is dropped.
#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    device_id: String,
    master_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    daemon_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    daemon_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    overlay_address: Option<IpAddr>,
}

impl Drop for StoredCredentials {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

impl From<&Credentials> for StoredCredentials {
    fn from(credentials: &Credentials) -> Self {
        Self {
            device_id: credentials.device_id.clone(),
            master_secret: hex::encode(credentials.master_secret.as_bytes()),
            daemon_host: credentials.daemon_host.clone(),
            daemon_port: credentials.daemon_port,
            overlay_address: credentials.overlay_address,
        }
    }
}

impl TryFrom<&StoredCredentials> for Credentials {
    type Error = Error;

    fn try_from(stored: &StoredCredentials) -> Result<Self, Error> {
        let master_secret = MasterSecret::from_hex(&stored.master_secret)
            .map_err(|e| Error::config(format!("stored master secret: {}", e)))?;
        Ok(Self {
            device_id: stored.device_id.clone(),
            master_secret,
            daemon_host: stored.daemon_host.clone(),
            daemon_port: stored.daemon_port,
            overlay_address: stored.overlay_address,
        })
    }
}

/// JSON file repository. The file is written with owner-only permissions
/// on Unix.
#[derive(Debug)]
pub struct FileCredentialRepository {
    path: PathBuf,
    cached: InMemoryCredentialRepository,
}

impl FileCredentialRepository {
    /// Load `path` if it exists; a missing file means "not paired".
    pub fn open(path: impl AsRef<Path>) -> ras_common::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cached = InMemoryCredentialRepository::new();
        if path.exists() {
            let text = Zeroizing::new(fs::read_to_string(&path)?);
            let stored: StoredCredentials = serde_json::from_str(&text)?;
            cached.store_credentials(Credentials::try_from(&stored)?)?;
            debug!("loaded credentials from {}", path.display());
        }
        Ok(Self { path, cached })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialRepository for FileCredentialRepository {
    fn has_credentials(&self) -> bool {
        self.cached.has_credentials()
    }

    fn get_credentials(&self) -> Option<Credentials> {
        self.cached.get_credentials()
    }

    fn store_credentials(&self, credentials: Credentials) -> ras_common::Result<()> {
        let text = Zeroizing::new(serde_json::to_string_pretty(&StoredCredentials::from(
            &credentials,
        ))?);
        fs::write(&self.path, text.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        self.cached.store_credentials(credentials)
    }

    fn clear_credentials(&self) -> ras_common::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cached.clear_credentials()
    }
}
