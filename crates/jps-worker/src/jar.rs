//! Output archive packaging
//!
//! Archives are byte-for-byte reproducible: manifest first, entries sorted by
//! name, fixed timestamps. Each archive is written next to its destination
//! and renamed into place.

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use jps_core::files::remove_file_if_exists;
use jps_core::{BuildError, RequestLog, SourceDescriptor};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::abi::is_abi_entry;
use crate::error::{Result, WorkerError};

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
const MANIFEST: &[u8] = b"Manifest-Version: 1.0\r\nCreated-By: jps-worker\r\n\r\n";

/// Pack every recorded output into `out_jar`, and the public API subset into
/// `abi_jar` when requested
pub fn package_to_jar(
    out_jar: &Path,
    abi_jar: Option<&Path>,
    descriptors: &[SourceDescriptor],
    class_out_dir: &Path,
    log: &RequestLog,
) -> Result<()> {
    let mut outputs: BTreeMap<String, PathBuf> = BTreeMap::new();
    for output in descriptors.iter().flat_map(|d| d.outputs.iter()) {
        match output.strip_prefix(class_out_dir) {
            Ok(relative) => {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name != MANIFEST_NAME {
                    outputs.insert(name, output.clone());
                }
            }
            Err(_) => log.debug(format!(
                "{} is outside of the class output directory, not packed",
                output.display()
            )),
        }
    }

    let outputs: Vec<(String, PathBuf)> = outputs.into_iter().collect();
    let entries = outputs
        .into_par_iter()
        .map(|(name, path)| match fs::read(&path) {
            Ok(content) => Ok((name, content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(WorkerError::MissingOutput(path.display().to_string()))
            }
            Err(e) => Err(WorkerError::from(BuildError::io(&path, e))),
        })
        .collect::<Result<Vec<(String, Vec<u8>)>>>()?;

    write_jar(out_jar, entries.iter())?;
    log.debug(format!("packed {} entries into {}", entries.len(), out_jar.display()));

    if let Some(abi_jar) = abi_jar {
        let abi_entries: Vec<&(String, Vec<u8>)> = entries
            .iter()
            .filter(|(name, content)| is_abi_entry(name, content))
            .collect();
        write_jar(abi_jar, abi_entries.iter().copied())?;
        log.debug(format!(
            "packed {} ABI entries into {}",
            abi_entries.len(),
            abi_jar.display()
        ));
    }
    Ok(())
}

fn entry_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

fn write_jar<'a>(path: &Path, entries: impl Iterator<Item = &'a (String, Vec<u8>)>) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| WorkerError::InvalidRequest(format!("{} is not a file path", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    match write_entries(path, &tmp, entries) {
        Ok(()) => fs::rename(&tmp, path).map_err(|e| WorkerError::from(BuildError::io(path, e))),
        Err(e) => {
            if let Err(cleanup) = remove_file_if_exists(&tmp) {
                tracing::warn!(path = %tmp.display(), error = %cleanup, "cannot remove temporary archive");
            }
            Err(e)
        }
    }
}

fn write_entries<'a>(
    path: &Path,
    tmp: &Path,
    entries: impl Iterator<Item = &'a (String, Vec<u8>)>,
) -> Result<()> {
    let archive_error = |source| WorkerError::Archive {
        path: path.display().to_string(),
        source,
    };
    let io_error = |e| WorkerError::from(BuildError::io(tmp, e));

    let file = File::create(tmp).map_err(io_error)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    zip.start_file(MANIFEST_NAME, entry_options()).map_err(archive_error)?;
    zip.write_all(MANIFEST).map_err(io_error)?;
    for (name, content) in entries {
        zip.start_file(name.as_str(), entry_options()).map_err(archive_error)?;
        zip.write_all(content).map_err(io_error)?;
    }

    let mut writer = zip.finish().map_err(archive_error)?;
    writer.flush().map_err(io_error)
}
