//! Cross-round symbol mappings
//!
//! Stages report which symbols a source provides (with a digest of their
//! public shape) and which symbols it uses. When a round finishes, users of
//! every symbol whose ABI changed or disappeared are scheduled for the next
//! round.
//!
//! Reads go through an in-memory overlay on top of the `mappings` tree.
//! Nothing is written to the store here: the overlay is committed by the
//! persistence task, in the same transaction as the descriptor table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{BuildError, Result};
use crate::relativizer::{PathKind, PathRelativizer};

/// Tree name inside the persistent store
pub const MAPPINGS_TREE: &str = "mappings";

/// A pending store write: key and new value, `None` meaning removal
pub type MappingWrite = (Vec<u8>, Option<Vec<u8>>);

const ABI: &str = "abi";
const USERS: &str = "users";
const USES: &str = "uses";
const PROVIDES: &str = "provides";

fn key(kind: &str, name: &str) -> Vec<u8> {
    format!("{kind}\0{name}").into_bytes()
}

pub struct Mappings {
    tree: sled::Tree,
    relativizer: Arc<PathRelativizer>,
    enabled: bool,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    round_provided: BTreeMap<PathBuf, BTreeMap<String, u64>>,
    round_used: BTreeMap<PathBuf, BTreeSet<String>>,
}

impl Mappings {
    pub fn new(tree: sled::Tree, relativizer: Arc<PathRelativizer>, enabled: bool) -> Self {
        Self {
            tree,
            relativizer,
            enabled,
            overlay: BTreeMap::new(),
            round_provided: BTreeMap::new(),
            round_used: BTreeMap::new(),
        }
    }

    /// `source` declares `symbol` with the given ABI digest
    pub fn provide(&mut self, source: &Path, symbol: impl Into<String>, abi_digest: u64) {
        self.round_provided
            .entry(source.to_path_buf())
            .or_default()
            .insert(symbol.into(), abi_digest);
    }

    /// `source` references `symbol`
    pub fn use_symbol(&mut self, source: &Path, symbol: impl Into<String>) {
        self.round_used
            .entry(source.to_path_buf())
            .or_default()
            .insert(symbol.into());
    }

    /// Drop registrations of the current round
    pub fn discard_round(&mut self) {
        self.round_provided.clear();
        self.round_used.clear();
    }

    /// Fold this round's registrations into the mappings. Returns sources,
    /// not compiled in this round, that use a symbol whose ABI changed.
    pub fn on_round_completion(&mut self, compiled: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut sources: BTreeSet<PathBuf> = compiled.iter().cloned().collect();
        sources.extend(self.round_provided.keys().cloned());
        sources.extend(self.round_used.keys().cloned());

        let mut provided = std::mem::take(&mut self.round_provided);
        let mut used = std::mem::take(&mut self.round_used);
        let mut updates = Vec::with_capacity(sources.len());
        for source in &sources {
            updates.push((
                source.clone(),
                used.remove(source).unwrap_or_default(),
                provided.remove(source).unwrap_or_default(),
            ));
        }

        let affected_symbols = self.apply(updates)?;
        self.users_of(&affected_symbols, &sources)
    }

    /// Forget a deleted source. Returns users of the symbols it provided.
    pub fn remove_source(&mut self, source: &Path) -> Result<Vec<PathBuf>> {
        let updates = vec![(source.to_path_buf(), BTreeSet::new(), BTreeMap::new())];
        let affected_symbols = self.apply(updates)?;
        self.users_of(&affected_symbols, &BTreeSet::from([source.to_path_buf()]))
    }

    /// Overlay contents, ready to be committed
    pub fn pending_writes(&self) -> Vec<MappingWrite> {
        self.overlay
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn apply(
        &mut self,
        updates: Vec<(PathBuf, BTreeSet<String>, BTreeMap<String, u64>)>,
    ) -> Result<BTreeSet<String>> {
        let mut affected = BTreeSet::new();

        // removals first, so a symbol that moved between sources keeps its new ABI
        for (source, new_uses, new_provides) in &updates {
            let relative = self.relativizer.to_relative(source, PathKind::Source);

            let old_uses = self.get_set(USES, &relative)?;
            for symbol in old_uses.difference(new_uses) {
                let mut users = self.get_set(USERS, symbol)?;
                users.remove(&relative);
                self.put_set(USERS, symbol, &users)?;
            }
            for symbol in new_uses.difference(&old_uses) {
                let mut users = self.get_set(USERS, symbol)?;
                users.insert(relative.clone());
                self.put_set(USERS, symbol, &users)?;
            }
            self.put_set(USES, &relative, new_uses)?;

            for symbol in self.get_set(PROVIDES, &relative)? {
                if !new_provides.contains_key(&symbol) {
                    self.overlay.insert(key(ABI, &symbol), None);
                    affected.insert(symbol);
                }
            }
        }

        for (source, _, new_provides) in &updates {
            let relative = self.relativizer.to_relative(source, PathKind::Source);
            for (symbol, abi) in new_provides {
                if self.get_abi(symbol)? != Some(*abi) {
                    self.overlay
                        .insert(key(ABI, symbol), Some(abi.to_be_bytes().to_vec()));
                    affected.insert(symbol.clone());
                }
            }
            let names: BTreeSet<String> = new_provides.keys().cloned().collect();
            self.put_set(PROVIDES, &relative, &names)?;
        }

        Ok(affected)
    }

    fn users_of(
        &self,
        symbols: &BTreeSet<String>,
        exclude: &BTreeSet<PathBuf>,
    ) -> Result<Vec<PathBuf>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let mut affected = BTreeSet::new();
        for symbol in symbols {
            for user in self.get_set(USERS, symbol)? {
                let path = self.relativizer.to_absolute(&user, PathKind::Source);
                if !exclude.contains(&path) {
                    affected.insert(path);
                }
            }
        }
        Ok(affected.into_iter().collect())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.overlay.get(key) {
            return Ok(value.clone());
        }
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn get_abi(&self, symbol: &str) -> Result<Option<u64>> {
        match self.get(&key(ABI, symbol))? {
            None => Ok(None),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    BuildError::Corrupted(format!("malformed ABI digest for {symbol}"))
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
        }
    }

    fn get_set(&self, kind: &str, name: &str) -> Result<BTreeSet<String>> {
        match self.get(&key(kind, name))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BTreeSet::new()),
        }
    }

    fn put_set(&mut self, kind: &str, name: &str, set: &BTreeSet<String>) -> Result<()> {
        let value = if set.is_empty() {
            None
        } else {
            Some(serde_json::to_vec(set)?)
        };
        self.overlay.insert(key(kind, name), value);
        Ok(())
    }
}
