//! Build Data Provider - per-source digests, outputs and stage metadata
//!
//! Owned by the build task. Stages read and write it only through the
//! compile context and the output consumer. A reverse index from output to
//! producing sources answers the many-to-one question: which other sources
//! must recompile together with this one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::digest::Digest;

/// Everything known about one tracked source file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub source: PathBuf,
    /// Digest of the content last compiled successfully
    pub digest: Digest,
    /// Produced outputs, in registration order
    pub outputs: Vec<PathBuf>,
    /// Opaque per-stage data, keyed by stage name
    pub metadata: BTreeMap<String, Vec<u8>>,
    /// Scheduled for recompilation in this build
    pub is_changed: bool,
}

pub struct BuildDataProvider {
    actual_digests: HashMap<PathBuf, Digest>,
    descriptors: HashMap<PathBuf, SourceDescriptor>,
    output_to_sources: HashMap<PathBuf, BTreeSet<PathBuf>>,
}

impl BuildDataProvider {
    /// No prior state: one changed descriptor per present source
    pub fn initial(actual_digests: HashMap<PathBuf, Digest>) -> Self {
        let descriptors = actual_digests
            .iter()
            .map(|(path, digest)| {
                let descriptor = SourceDescriptor {
                    source: path.clone(),
                    digest: digest.clone(),
                    is_changed: true,
                    ..Default::default()
                };
                (path.clone(), descriptor)
            })
            .collect();
        Self::with_descriptors(actual_digests, descriptors)
    }

    /// Prior state loaded from the store
    pub fn from_loaded(
        actual_digests: HashMap<PathBuf, Digest>,
        descriptors: HashMap<PathBuf, SourceDescriptor>,
    ) -> Self {
        Self::with_descriptors(actual_digests, descriptors)
    }

    /// Empty table, used by the recovery attempt
    pub fn empty(actual_digests: HashMap<PathBuf, Digest>) -> Self {
        Self::with_descriptors(actual_digests, HashMap::new())
    }

    fn with_descriptors(
        actual_digests: HashMap<PathBuf, Digest>,
        descriptors: HashMap<PathBuf, SourceDescriptor>,
    ) -> Self {
        let mut output_to_sources: HashMap<PathBuf, BTreeSet<PathBuf>> = HashMap::new();
        for descriptor in descriptors.values() {
            for output in &descriptor.outputs {
                output_to_sources
                    .entry(output.clone())
                    .or_default()
                    .insert(descriptor.source.clone());
            }
        }
        Self {
            actual_digests,
            descriptors,
            output_to_sources,
        }
    }

    pub fn descriptor(&self, source: &Path) -> Option<&SourceDescriptor> {
        self.descriptors.get(source)
    }

    pub fn outputs(&self, source: &Path) -> &[PathBuf] {
        self.descriptors
            .get(source)
            .map(|d| d.outputs.as_slice())
            .unwrap_or_default()
    }

    pub fn metadata(&self, source: &Path, stage: &str) -> Option<&[u8]> {
        self.descriptors
            .get(source)
            .and_then(|d| d.metadata.get(stage))
            .map(Vec::as_slice)
    }

    pub fn actual_digest(&self, source: &Path) -> Option<&Digest> {
        self.actual_digests.get(source)
    }

    /// Whether the source is part of the current input set
    pub fn is_present(&self, source: &Path) -> bool {
        self.actual_digests.contains_key(source)
    }

    pub fn source_count(&self) -> usize {
        self.actual_digests.len()
    }

    /// Flag a source for recompilation, creating its descriptor if needed
    pub fn mark_changed(&mut self, source: &Path) {
        let digest = self.actual_digests.get(source).cloned().unwrap_or_default();
        self.descriptors
            .entry(source.to_path_buf())
            .or_insert_with(|| SourceDescriptor {
                source: source.to_path_buf(),
                digest,
                ..Default::default()
            })
            .is_changed = true;
    }

    /// Forget the outputs of a source, returning them
    pub fn clear_outputs(&mut self, source: &Path) -> Vec<PathBuf> {
        let Some(descriptor) = self.descriptors.get_mut(source) else {
            return Vec::new();
        };
        let outputs = std::mem::take(&mut descriptor.outputs);
        for output in &outputs {
            self.unindex(output, source);
        }
        outputs
    }

    pub fn add_output(&mut self, source: &Path, output: &Path) {
        self.mark_changed(source);
        if let Some(descriptor) = self.descriptors.get_mut(source) {
            if !descriptor.outputs.iter().any(|o| o == output) {
                descriptor.outputs.push(output.to_path_buf());
            }
        }
        self.output_to_sources
            .entry(output.to_path_buf())
            .or_default()
            .insert(source.to_path_buf());
    }

    pub fn put_metadata(&mut self, source: &Path, stage: &str, data: Vec<u8>) {
        self.mark_changed(source);
        if let Some(descriptor) = self.descriptors.get_mut(source) {
            descriptor.metadata.insert(stage.to_string(), data);
        }
    }

    pub fn remove_source(&mut self, source: &Path) -> Option<SourceDescriptor> {
        let descriptor = self.descriptors.remove(source)?;
        for output in &descriptor.outputs {
            self.unindex(output, source);
        }
        Some(descriptor)
    }

    fn unindex(&mut self, output: &Path, source: &Path) {
        if let Some(sources) = self.output_to_sources.get_mut(output) {
            sources.remove(source);
            if sources.is_empty() {
                self.output_to_sources.remove(output);
            }
        }
    }

    /// Sources that jointly produced `output`, if any
    pub fn producers_of(&self, output: &Path) -> Option<&BTreeSet<PathBuf>> {
        self.output_to_sources.get(output)
    }

    /// Every source that produced at least one of the given outputs.
    /// Sorted, without duplicates.
    pub fn find_affected_sources(&self, output_groups: &[Vec<PathBuf>]) -> Vec<PathBuf> {
        let affected: BTreeSet<&PathBuf> = output_groups
            .iter()
            .flatten()
            .filter_map(|output| self.output_to_sources.get(output))
            .flatten()
            .collect();
        affected.into_iter().cloned().collect()
    }

    /// Record the current digest of every recompiled source
    pub fn mark_up_to_date(&mut self) {
        for descriptor in self.descriptors.values_mut().filter(|d| d.is_changed) {
            if let Some(digest) = self.actual_digests.get(&descriptor.source) {
                descriptor.digest = digest.clone();
                descriptor.is_changed = false;
            }
        }
    }

    /// Immutable snapshot for persistence: present sources, ordered by path
    pub fn final_list(&self) -> Vec<SourceDescriptor> {
        let mut list: Vec<SourceDescriptor> = self
            .descriptors
            .values()
            .filter(|d| self.actual_digests.contains_key(&d.source))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.source.cmp(&b.source));
        list
    }
}
