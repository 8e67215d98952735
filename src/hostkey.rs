use core::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::rngs::OsRng;
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{load_secret_key, PrivateKey, PublicKeyBase64};

#[derive(Debug)]
pub enum HostKeyError {
    Generate(String),
    Write(String),
}

impl fmt::Display for HostKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generate(e) => write!(f, "Failed to generate host key: {e}"),
            Self::Write(e) => write!(f, "Failed to write host key: {e}"),
        }
    }
}

impl std::error::Error for HostKeyError {}

/// Loads the bastion's host identity, generating a fresh RSA key when the
/// file is missing or unreadable. Fatal only when generation itself fails.
pub fn load_or_generate(path: &Path, bits: usize) -> Result<PrivateKey, HostKeyError> {
    if path.exists() {
        match load_secret_key(path, None) {
            Ok(key) => {
                info!("Loaded host key from {}", path.display());
                return Ok(key);
            }
            Err(e) => warn!("Failed to load host key from {}: {e}", path.display()),
        }
    }

    generate(path, bits)
}

fn generate(path: &Path, bits: usize) -> Result<PrivateKey, HostKeyError> {
    info!("Generating new RSA host key ({bits} bits)...");

    let keypair =
        RsaKeypair::random(&mut OsRng, bits).map_err(|e| HostKeyError::Generate(e.to_string()))?;
    let key = PrivateKey::new(KeypairData::Rsa(keypair), "ssb host key")
        .map_err(|e| HostKeyError::Generate(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| HostKeyError::Write(e.to_string()))?;
        }
    }

    key.write_openssh_file(path, LineEnding::LF)
        .map_err(|e| HostKeyError::Write(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| HostKeyError::Write(e.to_string()))?;
    }

    let public = format!("{} {} ssb host key\n", key.algorithm(), key.public_key_base64());
    fs::write(public_key_path(path), public).map_err(|e| HostKeyError::Write(e.to_string()))?;

    info!("Saved new host key to {}", path.display());
    Ok(key)
}

/// Companion file next to the private key, OpenSSH convention.
pub fn public_key_path(private_key_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.pub", private_key_path.display()))
}
