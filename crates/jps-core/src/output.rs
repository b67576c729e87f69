//! Output consumer - buffers what stages produce during a round
//!
//! The consumer knows its target and the stage currently running by name
//! only. Registered outputs, compiled classes and stage metadata are kept
//! here until the round completes, then committed to the build data provider.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::log::RequestLog;
use crate::provider::BuildDataProvider;

/// Class file held in memory until saved, so later stages can rewrite it
#[derive(Debug, Clone)]
pub struct CompiledClass {
    output: PathBuf,
    content: Vec<u8>,
    dirty: bool,
}

impl CompiledClass {
    pub fn new(output: impl Into<PathBuf>, content: Vec<u8>) -> Self {
        Self {
            output: output.into(),
            content,
            dirty: true,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Mutable bytes; the class will be written again on the next save
    pub fn content_mut(&mut self) -> &mut Vec<u8> {
        self.dirty = true;
        &mut self.content
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }
        fs::write(&self.output, &self.content).map_err(|e| BuildError::io(&self.output, e))?;
        self.dirty = false;
        Ok(())
    }
}

struct RegisteredOutput {
    sources: Vec<PathBuf>,
    output: PathBuf,
}

pub struct OutputConsumer {
    target_id: String,
    current_stage: Option<String>,
    outputs: Vec<RegisteredOutput>,
    classes: BTreeMap<PathBuf, CompiledClass>,
    metadata: Vec<(PathBuf, String, Vec<u8>)>,
    generated: Vec<PathBuf>,
    processed: BTreeMap<String, BTreeSet<PathBuf>>,
}

impl OutputConsumer {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            current_stage: None,
            outputs: Vec::new(),
            classes: BTreeMap::new(),
            metadata: Vec::new(),
            generated: Vec::new(),
            processed: BTreeMap::new(),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn set_current_stage(&mut self, stage: Option<&str>) {
        self.current_stage = stage.map(str::to_string);
    }

    pub fn current_stage(&self) -> Option<&str> {
        self.current_stage.as_deref()
    }

    /// Attribute `output` to every source that jointly produced it
    pub fn register_output(&mut self, sources: &[PathBuf], output: impl Into<PathBuf>) {
        let output = output.into();
        if let Some(stage) = &self.current_stage {
            self.processed
                .entry(stage.clone())
                .or_default()
                .extend(sources.iter().cloned());
        }
        self.generated.push(output.clone());
        self.outputs.push(RegisteredOutput {
            sources: sources.to_vec(),
            output,
        });
    }

    pub fn register_compiled_class(&mut self, sources: &[PathBuf], class: CompiledClass) {
        self.register_output(sources, class.output.clone());
        self.classes.insert(class.output.clone(), class);
    }

    pub fn compiled_class_mut(&mut self, output: &Path) -> Option<&mut CompiledClass> {
        self.classes.get_mut(output)
    }

    pub fn compiled_classes(&self) -> impl Iterator<Item = &CompiledClass> {
        self.classes.values()
    }

    /// Store opaque data for `source`, keyed by the running stage
    pub fn put_metadata(&mut self, source: &Path, data: Vec<u8>) -> Result<()> {
        let stage = self.current_stage.clone().ok_or_else(|| BuildError::Stage {
            stage: self.target_id.clone(),
            message: "metadata registered outside of a stage".to_string(),
        })?;
        self.metadata.push((source.to_path_buf(), stage, data));
        Ok(())
    }

    /// Distinct sources that produced something under `stage`
    pub fn processed_source_count(&self, stage: &str) -> usize {
        self.processed.get(stage).map_or(0, BTreeSet::len)
    }

    /// Write every modified in-memory class to disk
    pub fn save_instrumented_classes(&mut self) -> Result<usize> {
        let mut saved = 0;
        for class in self.classes.values_mut().filter(|c| c.is_dirty()) {
            class.save()?;
            saved += 1;
        }
        Ok(saved)
    }

    /// Save buffered classes and move registrations into the provider
    pub fn commit(&mut self, data: &mut BuildDataProvider) -> Result<()> {
        self.save_instrumented_classes()?;
        self.classes.clear();
        for registered in self.outputs.drain(..) {
            for source in &registered.sources {
                data.add_output(source, &registered.output);
            }
        }
        for (source, stage, bytes) in self.metadata.drain(..) {
            data.put_metadata(&source, &stage, bytes);
        }
        Ok(())
    }

    /// Report outputs generated since the last call
    pub fn fire_file_generated_events(&mut self, log: &RequestLog) {
        if self.generated.is_empty() {
            return;
        }
        let generated = std::mem::take(&mut self.generated);
        tracing::debug!(target = %self.target_id, count = generated.len(), "files generated");
        if log.is_debug_enabled() {
            for path in &generated {
                log.debug(format!("generated: {}", path.display()));
            }
        }
    }

    /// Drop everything buffered, saved or not
    pub fn clear(&mut self) {
        self.outputs.clear();
        self.classes.clear();
        self.metadata.clear();
        self.generated.clear();
    }
}
