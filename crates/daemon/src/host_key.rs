// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// SSH server identity key, persisted next to the daemon socket

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::PrivateKey;
use tracing::info;
use zeroize::Zeroizing;

pub const HOST_KEY_FILE_NAME: &str = "ssh_host_key";
pub const HOST_KEY_BITS: usize = 2048;

pub fn host_key_path(dir: &Path) -> PathBuf {
    dir.join(HOST_KEY_FILE_NAME)
}

/// Return the stored host key, generating and persisting one on first use
pub fn ensure_host_key(dir: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let path = host_key_path(dir);
    match fs::read(&path) {
        Ok(data) => return Ok(Zeroizing::new(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read host key {}", path.display()))
        }
    }

    info!("Generating new SSH host key...");
    let pem = generate_host_key()?;
    write_private(&path, pem.as_bytes())?;
    info!("Stored SSH host key at {}", path.display());

    Ok(Zeroizing::new(pem.as_bytes().to_vec()))
}

fn generate_host_key() -> Result<Zeroizing<String>> {
    let keypair = RsaKeypair::random(&mut OsRng, HOST_KEY_BITS)
        .context("Failed to generate RSA host key")?;
    let key = PrivateKey::new(KeypairData::from(keypair), "tailproxy host key")
        .context("Failed to build host key")?;
    key.to_openssh(LineEnding::LF)
        .context("Failed to encode host key")
}

// create_new keeps a concurrently written key intact
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create host key {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write host key {}", path.display()))?;
    Ok(())
}

/// Decode key bytes (OpenSSH, PKCS#1 or PKCS#8 PEM)
pub fn decode_host_key(data: &[u8]) -> Result<PrivateKey> {
    let text = std::str::from_utf8(data).context("Host key is not valid UTF-8")?;
    russh::keys::decode_secret_key(text, None).context("Failed to decode host key")
}
