//! Paired Peer Store
//!
//! Persists one record per paired host, keyed by peer address. The record
//! carries the ECDH-derived shared secret, so the file is sealed at rest
//! with AES-GCM under a per-install random key kept next to it.

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::transport::{CipherContext, SharedSecret};

/// A host this client has paired with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedPeer {
    /// Radio address of the peer.
    pub address: String,
    /// Human-readable name advertised by the peer.
    pub display_name: Option<String>,
    /// Stable identifier reported during pairing.
    pub peer_id: String,
    /// ECDH shared secret, base64.
    pub shared_secret: String,
    /// Unix seconds of first successful pairing.
    pub paired_at: u64,
    /// Unix seconds of the most recent successful (re)connection.
    pub last_connected_at: u64,
}

impl PairedPeer {
    pub fn secret(&self) -> Result<SharedSecret> {
        SharedSecret::from_base64(&self.shared_secret).context("stored shared secret corrupt")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PairedPeersFile {
    version: u32,
    peers: Vec<PairedPeer>,
}

impl Default for PairedPeersFile {
    fn default() -> Self {
        Self {
            version: 1,
            peers: Vec::new(),
        }
    }
}

/// Store for paired peer records.
pub struct PairedPeerStore {
    file_path: PathBuf,
    cipher: CipherContext,
    peers: Vec<PairedPeer>,
}

impl PairedPeerStore {
    /// Open (or create) the store under `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {:?}", data_dir))?;

        let cipher = Self::load_or_create_key(&data_dir.join("store.key"))?;
        let file_path = data_dir.join("paired_peers.bin");
        let peers = Self::load(&file_path, &cipher)?;

        info!("loaded {} paired peer(s) from {:?}", peers.len(), file_path);
        Ok(Self {
            file_path,
            cipher,
            peers,
        })
    }

    pub fn is_paired(&self, address: &str) -> bool {
        self.peers.iter().any(|p| p.address == address)
    }

    pub fn get(&self, address: &str) -> Option<&PairedPeer> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn list(&self) -> &[PairedPeer] {
        &self.peers
    }

    /// Record a successful pairing; refreshes an existing record in place.
    pub fn upsert(
        &mut self,
        address: &str,
        display_name: Option<String>,
        peer_id: &str,
        secret: &SharedSecret,
    ) -> Result<()> {
        let now = unix_now();
        if let Some(peer) = self.peers.iter_mut().find(|p| p.address == address) {
            peer.display_name = display_name;
            peer.peer_id = peer_id.to_string();
            peer.shared_secret = secret.to_base64();
            peer.last_connected_at = now;
            debug!("updated paired peer {}", address);
        } else {
            self.peers.push(PairedPeer {
                address: address.to_string(),
                display_name,
                peer_id: peer_id.to_string(),
                shared_secret: secret.to_base64(),
                paired_at: now,
                last_connected_at: now,
            });
            info!("added paired peer {}", address);
        }
        self.save()
    }

    /// Refresh `last_connected_at` after a successful reconnection.
    pub fn touch_connected(&mut self, address: &str) -> Result<()> {
        let peer = self
            .peers
            .iter_mut()
            .find(|p| p.address == address)
            .with_context(|| format!("peer {} not in store", address))?;
        peer.last_connected_at = unix_now();
        self.save()
    }

    /// Delete the record for `address`. Returns whether anything was removed.
    pub fn forget(&mut self, address: &str) -> Result<bool> {
        let before = self.peers.len();
        self.peers.retain(|p| p.address != address);
        let removed = self.peers.len() != before;
        if removed {
            info!("forgot paired peer {}", address);
            self.save()?;
        }
        Ok(removed)
    }

    fn load_or_create_key(path: &Path) -> Result<CipherContext> {
        let key: [u8; 32] = if path.exists() {
            let raw = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("store key file corrupt"))?
        } else {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            fs::write(path, key).with_context(|| format!("failed to write {:?}", path))?;
            key
        };
        CipherContext::from_shared_secret(&SharedSecret::from_bytes(key))
            .map_err(|e| anyhow::anyhow!("store cipher init failed: {e}"))
    }

    fn load(path: &Path, cipher: &CipherContext) -> Result<Vec<PairedPeer>> {
        if !path.exists() {
            debug!("paired peer file doesn't exist, starting empty");
            return Ok(Vec::new());
        }
        let sealed = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
        let json = cipher
            .open(&sealed)
            .map_err(|e| anyhow::anyhow!("paired peer file unreadable: {e}"))?;
        let file: PairedPeersFile =
            serde_json::from_slice(&json).context("failed to parse paired peer file")?;
        Ok(file.peers)
    }

    fn save(&self) -> Result<()> {
        let file = PairedPeersFile {
            version: 1,
            peers: self.peers.clone(),
        };
        let json = serde_json::to_vec(&file)?;
        let sealed = self
            .cipher
            .seal(&json)
            .map_err(|e| anyhow::anyhow!("paired peer file seal failed: {e}"))?;
        fs::write(&self.file_path, sealed)
            .with_context(|| format!("failed to write {:?}", self.file_path))?;
        debug!("saved {} paired peer(s)", self.peers.len());
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn secret() -> SharedSecret {
        SharedSecret::from_bytes([9u8; 32])
    }

    #[test]
    fn new_store_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let store = PairedPeerStore::new(dir.path())?;
        assert!(store.list().is_empty());
        Ok(())
    }

    #[test]
    fn upsert_and_get() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = PairedPeerStore::new(dir.path())?;
        store.upsert("aa:bb:cc", Some("Desk".into()), "host-1", &secret())?;

        assert!(store.is_paired("aa:bb:cc"));
        assert!(!store.is_paired("dd:ee:ff"));
        let peer = store.get("aa:bb:cc").unwrap();
        assert_eq!(peer.peer_id, "host-1");
        assert_eq!(peer.secret()?.to_base64(), secret().to_base64());
        Ok(())
    }

    #[test]
    fn upsert_existing_updates_in_place() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = PairedPeerStore::new(dir.path())?;
        store.upsert("aa:bb:cc", Some("Desk".into()), "host-1", &secret())?;
        store.upsert("aa:bb:cc", Some("Desk 2".into()), "host-1", &secret())?;

        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get("aa:bb:cc").unwrap().display_name.as_deref(), Some("Desk 2"));
        Ok(())
    }

    #[test]
    fn forget_removes_record() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = PairedPeerStore::new(dir.path())?;
        store.upsert("aa:bb:cc", None, "host-1", &secret())?;

        assert!(store.forget("aa:bb:cc")?);
        assert!(!store.forget("aa:bb:cc")?);
        assert!(!store.is_paired("aa:bb:cc"));
        Ok(())
    }

    #[test]
    fn persists_across_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let mut store = PairedPeerStore::new(dir.path())?;
            store.upsert("aa:bb:cc", Some("Desk".into()), "host-1", &secret())?;
        }
        let store = PairedPeerStore::new(dir.path())?;
        assert!(store.is_paired("aa:bb:cc"));
        Ok(())
    }

    #[test]
    fn file_on_disk_is_not_plaintext() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = PairedPeerStore::new(dir.path())?;
        store.upsert("aa:bb:cc", Some("Desk".into()), "host-1", &secret())?;

        let raw = fs::read(dir.path().join("paired_peers.bin"))?;
        let raw_str = String::from_utf8_lossy(&raw);
        assert!(!raw_str.contains("aa:bb:cc"));
        assert!(!raw_str.contains("shared_secret"));
        Ok(())
    }
}
