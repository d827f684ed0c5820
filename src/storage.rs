//! Secure Storage Module
//!
//! Key/value secret persistence. Every mutation goes through a single
//! [`SecretStore::commit`] so related entries (the token pair) change together.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info};

#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
};

const SECRETS_FILE: &str = "secrets.dat";

/// A batch of writes and removals applied atomically
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Edit {
    puts: Vec<(String, String)>,
    removes: Vec<String>,
}

impl Edit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: &str, value: &str) -> Self {
        self.puts.push((key.to_string(), value.to_string()));
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.removes.push(key.to_string());
        self
    }

    fn apply(self, entries: &mut HashMap<String, String>) {
        for key in self.removes {
            entries.remove(&key);
        }
        for (key, value) in self.puts {
            entries.insert(key, value);
        }
    }
}

/// Durable key/value store for secrets.
pub trait SecretStore: Send + Sync {
    /// Read a single entry
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Apply an edit atomically: either every change lands or none does
    fn commit(&self, edit: Edit) -> Result<(), StorageError>;
}

/// Encrypted file-backed store (DPAPI on Windows).
///
/// The whole namespace lives in one file that is rewritten through a
/// temporary file and a rename, so readers never see a half-applied edit.
pub struct SecureStorage {
    storage_path: PathBuf,
    lock: Mutex<()>,
}

impl SecureStorage {
    /// Create new secure storage rooted at `dir`
    pub fn new(dir: &Path) -> Self {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Secure storage initialized at: {:?}", dir);

        Self {
            storage_path: dir.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn file_path(&self) -> PathBuf {
        self.storage_path.join(SECRETS_FILE)
    }

    fn read_entries(&self) -> Result<HashMap<String, String>, StorageError> {
        let encrypted = match std::fs::read(self.file_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let decrypted = decrypt(&encrypted)?;
        let json =
            String::from_utf8(decrypted).map_err(|e| StorageError::Decryption(e.to_string()))?;

        serde_json::from_str(&json).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn write_entries(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string(entries)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let encrypted = encrypt(json.as_bytes())?;

        let target = self.file_path();
        let staging = target.with_extension("tmp");
        std::fs::write(&staging, encrypted).map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&staging, &target).map_err(|e| StorageError::Io(e.to_string()))
    }
}

impl SecretStore for SecureStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(self.read_entries()?.remove(key))
    }

    fn commit(&self, edit: Edit) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut entries = self.read_entries()?;
        edit.apply(&mut entries);
        self.write_entries(&entries)?;
        info!("Committed {} secret entries", entries.len());
        Ok(())
    }
}

/// Volatile store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn commit(&self, edit: Edit) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        edit.apply(&mut entries);
        Ok(())
    }
}

#[cfg(windows)]
fn encrypt(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    dpapi(data, true).ok_or_else(|| StorageError::Encryption("DPAPI encryption failed".into()))
}

#[cfg(windows)]
fn decrypt(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    dpapi(data, false).ok_or_else(|| StorageError::Decryption("DPAPI decryption failed".into()))
}

/// Run a buffer through CryptProtectData / CryptUnprotectData.
#[cfg(windows)]
fn dpapi(data: &[u8], protect: bool) -> Option<Vec<u8>> {
    let input = CRYPT_INTEGER_BLOB {
        cbData: data.len() as u32,
        pbData: data.as_ptr() as *mut u8,
    };
    let mut output = CRYPT_INTEGER_BLOB {
        cbData: 0,
        pbData: std::ptr::null_mut(),
    };

    unsafe {
        let result = if protect {
            CryptProtectData(&input, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut output)
        } else {
            CryptUnprotectData(&input, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut output)
        };
        if result.is_err() {
            return None;
        }

        let bytes = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

        // Buffer is allocated by DPAPI and must be released with LocalFree
        windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
            output.pbData as *mut std::ffi::c_void,
        ));

        Some(bytes)
    }
}

#[cfg(not(windows))]
fn encrypt(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    // Fallback for non-Windows: relies on the data directory's permissions
    Ok(data.to_vec())
}

#[cfg(not(windows))]
fn decrypt(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    Ok(data.to_vec())
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_applies_puts_and_removes_together() {
        let store = MemoryStore::new();
        store
            .commit(Edit::new().put("a", "1").put("b", "2"))
            .unwrap();
        store.commit(Edit::new().remove("a").put("b", "3")).unwrap();

        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn secure_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let store = SecureStorage::new(dir.path());
        assert_eq!(store.get("access_token").unwrap(), None);
        store
            .commit(Edit::new().put("access_token", "a1").put("refresh_token", "r1"))
            .unwrap();

        let reopened = SecureStorage::new(dir.path());
        assert_eq!(reopened.get("access_token").unwrap().as_deref(), Some("a1"));
        assert_eq!(reopened.get("refresh_token").unwrap().as_deref(), Some("r1"));

        reopened
            .commit(Edit::new().remove("access_token").remove("refresh_token"))
            .unwrap();
        assert_eq!(store.get("refresh_token").unwrap(), None);
        assert!(!dir.path().join("secrets.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SECRETS_FILE), b"not json").unwrap();

        let store = SecureStorage::new(dir.path());
        assert!(store.get("access_token").is_err());
    }
}
