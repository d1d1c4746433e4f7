use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Filesystem-backed key/value engine underneath [`crate::task::KvTaskStore`].
#[derive(Clone, Debug)]
pub struct FsKv {
    root: PathBuf,
}

/// Minimal byte key/value interface.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> Result<(), StoreError>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> Result<bool, StoreError>;
}

/// Bincode helpers layered on top of any [`Kv`].
pub trait KvSerde: Kv {
    /// Deserialize the `T` stored at `key`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize::<T>(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize `val` and store it at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<(), StoreError> {
        let buf = bincode::serialize(val)?;
        self.put(key, &buf)
    }
}

impl<T: Kv> KvSerde for T {}

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_fs<P: AsRef<Path>>(dir: P) -> Result<FsKv, StoreError> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)?;
    Ok(FsKv { root })
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

/* --------------------- impl FsKv --------------------- */

impl FsKv {
    /// Directory holding the value files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Windows-safe: map arbitrary bytes to a hex file name.
        let mut name = String::with_capacity(key.len() * 2);
        for &b in key {
            name.push(hex_digit(b >> 4));
            name.push(hex_digit(b & 0xF));
        }
        self.root.join(name)
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        // Write temp then rename so readers never see a torn value.
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(val)?;
        f.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
