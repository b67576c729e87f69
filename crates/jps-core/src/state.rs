//! Build State Loader/Saver
//!
//! The descriptor table and the target configuration digests live in two
//! trees of the persistent store:
//! - `meta`: format version and one entry per configuration digest
//! - `sources`: relative source path -> JSON descriptor
//!
//! Saving replaces both trees and commits pending symbol mappings in a single
//! multi-tree transaction, so a cancelled or failed save leaves the previous
//! state intact.

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::change::{compute_change_set, ChangeSet};
use crate::digest::{digest64, Digest};
use crate::error::{BuildError, Result};
use crate::log::RequestLog;
use crate::mappings::{MappingWrite, MAPPINGS_TREE};
use crate::provider::SourceDescriptor;
use crate::relativizer::{PathKind, PathRelativizer};

pub const STATE_FILE_FORMAT_VERSION: &str = "1";
pub const VERSION_META_NAME: &str = "version";
pub const META_TREE: &str = "meta";
pub const SOURCES_TREE: &str = "sources";

/// Named configuration digests that invalidate the whole target when changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetConfigurationDigestProperty {
    ModuleName,
    KotlincArgs,
    JavacArgs,
    Classpath,
}

impl TargetConfigurationDigestProperty {
    pub const ALL: [Self; 4] = [
        Self::ModuleName,
        Self::KotlincArgs,
        Self::JavacArgs,
        Self::Classpath,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ModuleName => "MODULE_NAME",
            Self::KotlincArgs => "KOTLINC_ARGS",
            Self::JavacArgs => "JAVAC_ARGS",
            Self::Classpath => "CLASSPATH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetConfigurationDigestContainer {
    values: [u64; 4],
}

impl TargetConfigurationDigestContainer {
    /// Digest the target configuration. `dependencies` maps classpath entries
    /// (relative paths) to their content digests.
    pub fn compute(
        module_name: &str,
        kotlinc_args: &[String],
        javac_args: &[String],
        dependencies: &BTreeMap<String, Digest>,
    ) -> Self {
        let mut container = Self::default();
        container.set(
            TargetConfigurationDigestProperty::ModuleName,
            digest64([module_name.as_bytes()]),
        );
        container.set(
            TargetConfigurationDigestProperty::KotlincArgs,
            digest64(kotlinc_args.iter().map(|a| a.as_bytes())),
        );
        container.set(
            TargetConfigurationDigestProperty::JavacArgs,
            digest64(javac_args.iter().map(|a| a.as_bytes())),
        );
        container.set(
            TargetConfigurationDigestProperty::Classpath,
            digest64(
                dependencies
                    .iter()
                    .flat_map(|(path, digest)| [path.as_bytes(), digest.as_bytes()]),
            ),
        );
        container
    }

    pub fn get(&self, property: TargetConfigurationDigestProperty) -> u64 {
        self.values[property as usize]
    }

    pub fn set(&mut self, property: TargetConfigurationDigestProperty, value: u64) {
        self.values[property as usize] = value;
    }
}

/// Why the persisted state cannot be used incrementally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    FormatVersion { expected: String, actual: String },
    TargetConfiguration(TargetConfigurationDigestProperty),
    Unreadable(String),
}

impl RebuildReason {
    pub fn is_configuration_change(&self) -> bool {
        matches!(self, Self::TargetConfiguration(_))
    }
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FormatVersion { expected, actual } => write!(
                f,
                "build state format version mismatch (expected {expected}, found {actual}), rebuild required"
            ),
            Self::TargetConfiguration(property) => write!(
                f,
                "target configuration digest {} changed, rebuild required",
                property.name()
            ),
            Self::Unreadable(message) => {
                write!(f, "cannot read build state, rebuild required: {message}")
            }
        }
    }
}

/// Prior state of the target, as loaded at the start of an invocation
#[derive(Debug, Clone, Default)]
pub struct LoadStateResult {
    pub map: HashMap<PathBuf, SourceDescriptor>,
    pub rebuild_requested: Option<RebuildReason>,
    pub changes: ChangeSet,
}

impl LoadStateResult {
    fn rebuild(reason: RebuildReason) -> Self {
        Self {
            rebuild_requested: Some(reason),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredDescriptor {
    digest: Digest,
    outputs: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Vec<u8>>,
}

/// Load the state persisted by the previous successful build.
///
/// `None` means there is no state at all. A state that exists but cannot be
/// used is returned with `rebuild_requested` set.
pub fn load_build_state(
    store_file: &Path,
    relativizer: &PathRelativizer,
    actual_digests: &HashMap<PathBuf, Digest>,
    target_digests: &TargetConfigurationDigestContainer,
    log: &RequestLog,
) -> Option<LoadStateResult> {
    if !store_file.exists() {
        return None;
    }

    let db = match sled::Config::new().path(store_file).open() {
        Ok(db) => db,
        Err(e) => {
            return Some(LoadStateResult::rebuild(RebuildReason::Unreadable(
                format!("cannot open {}: {e}", store_file.display()),
            )))
        }
    };

    match read_build_state(&db, relativizer, actual_digests, target_digests) {
        Ok(result) => result,
        Err(e) => {
            log.warn(format!("cannot load build state from {}: {e}", store_file.display()));
            Some(LoadStateResult::rebuild(RebuildReason::Unreadable(e.to_string())))
        }
    }
}

fn read_digest(meta: &sled::Tree, name: &str) -> Result<Option<u64>> {
    match meta.get(name)? {
        None => Ok(None),
        Some(value) => {
            let bytes: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| BuildError::Corrupted(format!("malformed digest {name}")))?;
            Ok(Some(u64::from_be_bytes(bytes)))
        }
    }
}

fn read_build_state(
    db: &sled::Db,
    relativizer: &PathRelativizer,
    actual_digests: &HashMap<PathBuf, Digest>,
    target_digests: &TargetConfigurationDigestContainer,
) -> Result<Option<LoadStateResult>> {
    let meta = db.open_tree(META_TREE)?;
    let Some(version) = meta.get(VERSION_META_NAME)? else {
        // store created, but no build ever completed
        return Ok(None);
    };
    let version = String::from_utf8_lossy(&version).to_string();
    if version != STATE_FILE_FORMAT_VERSION {
        return Ok(Some(LoadStateResult::rebuild(RebuildReason::FormatVersion {
            expected: STATE_FILE_FORMAT_VERSION.to_string(),
            actual: version,
        })));
    }

    for property in TargetConfigurationDigestProperty::ALL {
        if read_digest(&meta, property.name())? != Some(target_digests.get(property)) {
            return Ok(Some(LoadStateResult::rebuild(
                RebuildReason::TargetConfiguration(property),
            )));
        }
    }

    let sources = db.open_tree(SOURCES_TREE)?;
    let mut map = HashMap::with_capacity(sources.len());
    for item in sources.iter() {
        let (key, value) = item?;
        let relative = std::str::from_utf8(&key)
            .map_err(|_| BuildError::Corrupted("non UTF-8 source key".to_string()))?;
        let stored: StoredDescriptor = serde_json::from_slice(&value)?;
        let source = relativizer.to_absolute(relative, PathKind::Source);
        let descriptor = SourceDescriptor {
            source: source.clone(),
            digest: stored.digest,
            outputs: stored
                .outputs
                .iter()
                .map(|o| relativizer.to_absolute(o, PathKind::Output))
                .collect(),
            metadata: stored.metadata,
            is_changed: false,
        };
        map.insert(source, descriptor);
    }

    let changes = compute_change_set(actual_digests, &map);
    Ok(Some(LoadStateResult {
        map,
        rebuild_requested: None,
        changes,
    }))
}

/// Persist the final descriptor snapshot, configuration digests and pending
/// mappings. Cancellation is honored up to the moment of commit.
pub fn save_build_state(
    db: &sled::Db,
    descriptors: &[SourceDescriptor],
    relativizer: &PathRelativizer,
    target_digests: &TargetConfigurationDigestContainer,
    mapping_writes: &[MappingWrite],
    cancel: &CancelToken,
) -> Result<()> {
    let sources = db.open_tree(SOURCES_TREE)?;
    let meta = db.open_tree(META_TREE)?;
    let mappings = db.open_tree(MAPPINGS_TREE)?;

    let records = descriptors
        .iter()
        .map(|d| {
            let stored = StoredDescriptor {
                digest: d.digest.clone(),
                outputs: d
                    .outputs
                    .iter()
                    .map(|o| relativizer.to_relative(o, PathKind::Output))
                    .collect(),
                metadata: d.metadata.clone(),
            };
            let key = relativizer.to_relative(&d.source, PathKind::Source);
            Ok((key.into_bytes(), serde_json::to_vec(&stored)?))
        })
        .collect::<Result<Vec<(Vec<u8>, Vec<u8>)>>>()?;

    let live: HashSet<&[u8]> = records.iter().map(|(k, _)| k.as_slice()).collect();
    let stale: Vec<Vec<u8>> = sources
        .iter()
        .keys()
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|k| !live.contains(k.as_ref()))
        .map(|k| k.to_vec())
        .collect();

    let mut meta_records: Vec<(&str, Vec<u8>)> =
        vec![(VERSION_META_NAME, STATE_FILE_FORMAT_VERSION.as_bytes().to_vec())];
    for property in TargetConfigurationDigestProperty::ALL {
        meta_records.push((
            property.name(),
            target_digests.get(property).to_be_bytes().to_vec(),
        ));
    }

    cancel.check()?;

    (&sources, &meta, &mappings)
        .transaction(|(tx_sources, tx_meta, tx_mappings)| {
            for key in &stale {
                tx_sources.remove(key.as_slice())?;
            }
            for (key, value) in &records {
                tx_sources.insert(key.as_slice(), value.as_slice())?;
            }
            for (key, value) in &meta_records {
                tx_meta.insert(*key, value.as_slice())?;
            }
            for (key, value) in mapping_writes {
                match value {
                    Some(value) => tx_mappings.insert(key.as_slice(), value.as_slice())?,
                    None => tx_mappings.remove(key.as_slice())?,
                };
            }
            Ok::<(), ConflictableTransactionError<()>>(())
        })
        .map_err(|e| match e {
            TransactionError::Abort(()) => {
                BuildError::Corrupted("build state transaction aborted".to_string())
            }
            TransactionError::Storage(e) => BuildError::Store(e),
        })?;

    db.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        store_file: PathBuf,
        relativizer: PathRelativizer,
        digests: TargetConfigurationDigestContainer,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store_file = dir.path().join("lib-jps-data").join("jps-portable-cache.db");
        let relativizer = PathRelativizer::new(dir.path(), dir.path().join("lib-classes"));
        let digests = TargetConfigurationDigestContainer::compute(
            "lib",
            &["-jvm-target=17".to_string()],
            &[],
            &BTreeMap::new(),
        );
        Fixture {
            _dir: dir,
            store_file,
            relativizer,
            digests,
        }
    }

    fn descriptor(fixture: &Fixture, name: &str, content: &[u8]) -> SourceDescriptor {
        let source = fixture.relativizer.to_absolute(&format!("src/{name}.kt"), PathKind::Source);
        SourceDescriptor {
            source,
            digest: Digest::of(content),
            outputs: vec![fixture
                .relativizer
                .to_absolute(&format!("{name}.class"), PathKind::Output)],
            metadata: BTreeMap::from([("kotlin".to_string(), vec![9])]),
            is_changed: false,
        }
    }

    fn save(fixture: &Fixture, list: &[SourceDescriptor], digests: &TargetConfigurationDigestContainer) {
        let db = sled::Config::new().path(&fixture.store_file).open().unwrap();
        save_build_state(&db, list, &fixture.relativizer, digests, &[], &CancelToken::new()).unwrap();
    }

    #[test]
    fn test_absent_store_means_no_state() {
        let fixture = fixture();
        let log = RequestLog::new(false);
        let state = load_build_state(
            &fixture.store_file,
            &fixture.relativizer,
            &HashMap::new(),
            &fixture.digests,
            &log,
        );
        assert!(state.is_none());
    }

    #[test]
    fn test_save_then_load_detects_changes() {
        let fixture = fixture();
        let a = descriptor(&fixture, "A", b"a");
        let b = descriptor(&fixture, "B", b"b");
        save(&fixture, &[a.clone(), b.clone()], &fixture.digests);

        let actual = HashMap::from([
            (a.source.clone(), Digest::of(b"a")),
            (b.source.clone(), Digest::of(b"b2")),
        ]);
        let log = RequestLog::new(false);
        let state = load_build_state(&fixture.store_file, &fixture.relativizer, &actual, &fixture.digests, &log)
            .unwrap();

        assert!(state.rebuild_requested.is_none());
        assert_eq!(state.map.get(&a.source), Some(&a));
        assert_eq!(state.changes.changed_files, vec![b.source.clone()]);
        assert!(state.changes.deleted_files.is_empty());
    }

    #[test]
    fn test_save_removes_stale_descriptors() {
        let fixture = fixture();
        let a = descriptor(&fixture, "A", b"a");
        let b = descriptor(&fixture, "B", b"b");
        save(&fixture, &[a.clone(), b], &fixture.digests);
        save(&fixture, &[a.clone()], &fixture.digests);

        let actual = HashMap::from([(a.source.clone(), Digest::of(b"a"))]);
        let log = RequestLog::new(false);
        let state = load_build_state(&fixture.store_file, &fixture.relativizer, &actual, &fixture.digests, &log)
            .unwrap();
        assert_eq!(state.map.len(), 1);
        assert!(state.changes.is_empty());
    }

    #[test]
    fn test_configuration_change_requests_rebuild() {
        let fixture = fixture();
        save(&fixture, &[descriptor(&fixture, "A", b"a")], &fixture.digests);

        let mut changed = fixture.digests;
        changed.set(TargetConfigurationDigestProperty::Classpath, 42);
        let log = RequestLog::new(false);
        let state = load_build_state(&fixture.store_file, &fixture.relativizer, &HashMap::new(), &changed, &log)
            .unwrap();
        let reason = state.rebuild_requested.unwrap();
        assert_eq!(
            reason,
            RebuildReason::TargetConfiguration(TargetConfigurationDigestProperty::Classpath)
        );
        assert!(reason.is_configuration_change());
    }

    #[test]
    fn test_format_version_mismatch_requests_rebuild() {
        let fixture = fixture();
        {
            let db = sled::Config::new().path(&fixture.store_file).open().unwrap();
            db.open_tree(META_TREE).unwrap().insert(VERSION_META_NAME, "0").unwrap();
            db.flush().unwrap();
        }
        let log = RequestLog::new(false);
        let state = load_build_state(&fixture.store_file, &fixture.relativizer, &HashMap::new(), &fixture.digests, &log)
            .unwrap();
        assert!(matches!(
            state.rebuild_requested,
            Some(RebuildReason::FormatVersion { .. })
        ));
    }

    #[test]
    fn test_cancelled_save_commits_nothing() {
        let fixture = fixture();
        let db = sled::Config::new().path(&fixture.store_file).open().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = save_build_state(
            &db,
            &[descriptor(&fixture, "A", b"a")],
            &fixture.relativizer,
            &fixture.digests,
            &[],
            &cancel,
        );
        assert!(matches!(result, Err(BuildError::Cancelled)));
        assert!(db.open_tree(SOURCES_TREE).unwrap().is_empty());
        assert!(db.open_tree(META_TREE).unwrap().is_empty());
    }

    #[test]
    fn test_configuration_digests_differ_per_property() {
        let base = TargetConfigurationDigestContainer::compute("lib", &[], &[], &BTreeMap::new());
        let other = TargetConfigurationDigestContainer::compute(
            "lib",
            &[],
            &[],
            &BTreeMap::from([("lib/dep.jar".to_string(), Digest::of(b"jar"))]),
        );
        assert_eq!(
            base.get(TargetConfigurationDigestProperty::ModuleName),
            other.get(TargetConfigurationDigestProperty::ModuleName)
        );
        assert_ne!(
            base.get(TargetConfigurationDigestProperty::Classpath),
            other.get(TargetConfigurationDigestProperty::Classpath)
        );
    }
}
