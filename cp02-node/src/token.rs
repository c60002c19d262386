//! Session token: persistence per charger address and brute-force search

use std::collections::HashMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where tokens live between runs, keyed by charger address
pub trait TokenStorage {
    fn load(&self, peer: &str) -> std::io::Result<Option<u8>>;
    fn save(&mut self, peer: &str, token: u8) -> std::io::Result<()>;
    fn remove(&mut self, peer: &str) -> std::io::Result<()>;
}

/// One entry of the token file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: u8,
    pub last_used: u64,
}

/// `{address: {token, last_used}}` in a JSON file
#[derive(Debug, Clone)]
pub struct JsonTokenFile {
    path: PathBuf,
}

impl JsonTokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> std::io::Result<HashMap<String, TokenRecord>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(std::io::Error::other)
    }

    fn write(&self, records: &HashMap<String, TokenRecord>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(records).map_err(std::io::Error::other)?;
        fs::write(&self.path, data)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn normalize(peer: &str) -> String {
    peer.to_uppercase()
}

impl TokenStorage for JsonTokenFile {
    fn load(&self, peer: &str) -> std::io::Result<Option<u8>> {
        Ok(self.records()?.get(&normalize(peer)).map(|r| r.token))
    }

    fn save(&mut self, peer: &str, token: u8) -> std::io::Result<()> {
        let mut records = self.records()?;
        records.insert(normalize(peer), TokenRecord { token, last_used: now_secs() });
        self.write(&records)
    }

    fn remove(&mut self, peer: &str) -> std::io::Result<()> {
        let mut records = self.records()?;
        if records.remove(&normalize(peer)).is_some() {
            self.write(&records)?;
        }
        Ok(())
    }
}

/// Process-local storage, for tests and one-shot CLI runs
#[derive(Debug, Clone, Default)]
pub struct MemoryTokens {
    tokens: HashMap<String, u8>,
}

impl TokenStorage for MemoryTokens {
    fn load(&self, peer: &str) -> std::io::Result<Option<u8>> {
        Ok(self.tokens.get(&normalize(peer)).copied())
    }

    fn save(&mut self, peer: &str, token: u8) -> std::io::Result<()> {
        self.tokens.insert(normalize(peer), token);
        Ok(())
    }

    fn remove(&mut self, peer: &str) -> std::io::Result<()> {
        self.tokens.remove(&normalize(peer));
        Ok(())
    }
}

impl<S: TokenStorage + ?Sized> TokenStorage for Box<S> {
    fn load(&self, peer: &str) -> std::io::Result<Option<u8>> {
        (**self).load(peer)
    }

    fn save(&mut self, peer: &str, token: u8) -> std::io::Result<()> {
        (**self).save(peer, token)
    }

    fn remove(&mut self, peer: &str) -> std::io::Result<()> {
        (**self).remove(peer)
    }
}

/// The token in use for the current charger.
///
/// Resolution order on [`TokenStore::bind`]: configured override, then the
/// persisted token for that address, then a token set before any charger was
/// bound (which is then persisted for the new address). While a search runs,
/// manual writes and a second search are refused with [`Error::TokenBusy`].
#[derive(Debug)]
pub struct TokenStore<S> {
    storage: S,
    override_token: Option<u8>,
    peer: Option<String>,
    current: Option<u8>,
    unbound: Option<u8>,
    searching: bool,
}

pub type SharedTokenStore<S> = Arc<Mutex<TokenStore<S>>>;

impl<S: TokenStorage> TokenStore<S> {
    pub fn new(storage: S, override_token: Option<u8>) -> Self {
        Self {
            storage,
            override_token,
            peer: None,
            current: override_token,
            unbound: None,
            searching: false,
        }
    }

    pub fn shared(self) -> SharedTokenStore<S> {
        Arc::new(Mutex::new(self))
    }

    /// Switch to the charger at `peer` and return the token to use for it
    pub fn bind(&mut self, peer: &str) -> Option<u8> {
        self.peer = Some(peer.to_string());
        if let Some(token) = self.override_token {
            self.current = Some(token);
            return self.current;
        }

        let stored = self.storage.load(peer).unwrap_or_else(|e| {
            log::warn!("token storage unreadable for {peer}: {e}");
            None
        });
        self.current = match (stored, self.unbound.take()) {
            (Some(token), _) => Some(token),
            (None, Some(token)) => {
                if let Err(e) = self.storage.save(peer, token) {
                    log::warn!("could not persist token for {peer}: {e}");
                }
                Some(token)
            }
            (None, None) => None,
        };
        if let Some(token) = self.current {
            log::info!("using token 0x{token:02x} for {peer}");
        }
        self.current
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn get(&self) -> Option<u8> {
        self.current
    }

    pub fn set(&mut self, token: u8) -> Result<()> {
        if self.searching {
            return Err(Error::TokenBusy);
        }
        self.store(token)
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.searching {
            return Err(Error::TokenBusy);
        }
        self.current = None;
        self.unbound = None;
        if let Some(peer) = &self.peer {
            self.storage.remove(peer)?;
        }
        Ok(())
    }

    fn store(&mut self, token: u8) -> Result<()> {
        self.current = Some(token);
        match &self.peer {
            Some(peer) => self.storage.save(peer, token)?,
            None => self.unbound = Some(token),
        }
        Ok(())
    }

    pub fn is_searching(&self) -> bool {
        self.searching
    }

    pub fn begin_search(&mut self, range: RangeInclusive<u8>) -> Result<TokenSearch> {
        if self.searching {
            return Err(Error::TokenBusy);
        }
        self.searching = true;
        Ok(TokenSearch::new(range))
    }

    /// End the running search; a found token becomes current and is persisted
    pub fn finish_search(&mut self, found: Option<u8>) -> Result<()> {
        self.searching = false;
        match found {
            Some(token) => {
                log::info!("token found: 0x{token:02x}");
                self.store(token)
            }
            None => Ok(()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}

/// Ascending candidates over a range; stepped one probe at a time by whoever
/// owns the link.
#[derive(Debug, Clone)]
pub struct TokenSearch {
    next: u16,
    end: u16,
    attempts: u32,
    cancelled: bool,
}

impl TokenSearch {
    pub fn new(range: RangeInclusive<u8>) -> Self {
        Self {
            next: *range.start() as u16,
            end: *range.end() as u16,
            attempts: 0,
            cancelled: false,
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Candidates handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining(&self) -> u16 {
        if self.cancelled { 0 } else { (self.end + 1).saturating_sub(self.next) }
    }
}

impl Iterator for TokenSearch {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.cancelled || self.next > self.end {
            return None;
        }
        let candidate = self.next as u8;
        self.next += 1;
        self.attempts += 1;
        Some(candidate)
    }
}
