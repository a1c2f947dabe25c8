use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

use super::{INTERMEDIATE_CA_PEM, ROOT_CA_PEM};
use crate::error::{ProxyError, Result};

/// Which platform store a certificate belongs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreName {
    /// Trusted root authorities
    Root,
    /// Intermediate authorities
    Ca,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Root => "Root",
            StoreName::Ca => "CA",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            StoreName::Root => "tracksocks-root-ca.crt",
            StoreName::Ca => "tracksocks-intermediate-ca.crt",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Somewhere trust anchors can be installed
pub trait TrustStore: Send + Sync {
    /// Install `pem` into `store`; `Ok(false)` means the platform declined
    fn install(&self, store: StoreName, pem: &str) -> Result<bool>;
}

/// The operating system's certificate store, driven through its own tools
#[derive(Debug, Clone)]
pub struct SystemTrustStore {
    staging_dir: PathBuf,
}

impl Default for SystemTrustStore {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl SystemTrustStore {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    fn stage(&self, store: StoreName, pem: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let path = self.staging_dir.join(store.file_name());
        std::fs::write(&path, pem)?;
        Ok(path)
    }
}

fn run(program: &str, args: &[&str]) -> Result<bool> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        ProxyError::Certificate(format!("Failed to run {}: {}", program, e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(program, status = %output.status, stderr = %stderr.trim(), "Trust store command failed");
    }
    Ok(output.status.success())
}

#[cfg(target_os = "windows")]
fn install_platform(store: StoreName, path: &Path) -> Result<bool> {
    let path = path.to_string_lossy();
    if run("certutil", &["-addstore", "-f", store.as_str(), &path])? {
        return Ok(true);
    }
    // Without elevation only the per-user store is writable.
    run("certutil", &["-user", "-addstore", "-f", store.as_str(), &path])
}

#[cfg(target_os = "macos")]
fn install_platform(store: StoreName, path: &Path) -> Result<bool> {
    let path = path.to_string_lossy();
    let trust = match store {
        StoreName::Root => "trustRoot",
        StoreName::Ca => "trustAsRoot",
    };
    let keychain = format!(
        "{}/Library/Keychains/login.keychain-db",
        std::env::var("HOME").unwrap_or_default()
    );
    run("security", &["add-trusted-cert", "-r", trust, "-k", &keychain, &path])
}

#[cfg(target_os = "linux")]
fn install_platform(store: StoreName, path: &Path) -> Result<bool> {
    let anchors = [
        ("/usr/local/share/ca-certificates", "update-ca-certificates", &[][..]),
        ("/etc/pki/ca-trust/source/anchors", "update-ca-trust", &["extract"][..]),
        ("/etc/ca-certificates/trust-source/anchors", "trust", &["extract-compat"][..]),
    ];

    let Some((dir, refresh, refresh_args)) =
        anchors.iter().find(|(dir, _, _)| Path::new(dir).is_dir())
    else {
        return Err(ProxyError::Certificate(
            "No known CA anchor directory on this system".to_string(),
        ));
    };

    std::fs::copy(path, Path::new(dir).join(store.file_name()))?;
    run(refresh, refresh_args)
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn install_platform(_store: StoreName, _path: &Path) -> Result<bool> {
    Err(ProxyError::Certificate("Unsupported operating system".to_string()))
}

impl TrustStore for SystemTrustStore {
    fn install(&self, store: StoreName, pem: &str) -> Result<bool> {
        let path = self.stage(store, pem)?;
        install_platform(store, &path)
    }
}

/// Install the embedded root and intermediate certificates
///
/// Failures are logged and counted, never raised. Returns how many of the
/// two certificates were installed.
pub fn install_trust_anchors(store: &dyn TrustStore) -> usize {
    [
        (StoreName::Root, ROOT_CA_PEM),
        (StoreName::Ca, INTERMEDIATE_CA_PEM),
    ]
    .into_iter()
    .filter(|(name, pem)| match store.install(*name, pem) {
        Ok(true) => {
            info!(store = %name, "Installed trust anchor");
            true
        }
        Ok(false) => {
            warn!(store = %name, "Trust anchor was not installed");
            false
        }
        Err(e) => {
            warn!(store = %name, error = %e, "Failed to install trust anchor");
            false
        }
    })
    .count()
}
