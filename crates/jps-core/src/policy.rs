//! Rebuild Policy - incremental or full rebuild

use crate::log::RequestLog;
use crate::relativizer::{PathKind, PathRelativizer};
use crate::state::LoadStateResult;

/// Decide whether the loaded state should be thrown away.
///
/// An explicit rebuild reason always wins. Otherwise a full rebuild is chosen
/// once the number of changed and deleted files reaches
/// `source_count * threshold`.
pub fn check_is_full_rebuild_required(
    state: &LoadStateResult,
    log: &RequestLog,
    relativizer: &PathRelativizer,
    source_count: usize,
    threshold: f64,
) -> bool {
    if let Some(reason) = &state.rebuild_requested {
        log.warn(reason.to_string());
        return true;
    }

    let changes = &state.changes;
    let effort = changes.effort();
    let limit = source_count as f64 * threshold;
    let full = effort as f64 >= limit;

    let message = format!(
        "incremental effort: {effort} (changed: {}, deleted: {}), sources: {source_count}, threshold: {threshold}, limit: {limit}, full rebuild: {full}",
        changes.changed_files.len(),
        changes.deleted_files.len(),
    );
    if full {
        log.warn(format!("rebuild required, incremental effort exceeds limit. {message}"));
    } else {
        log.info(message);
    }

    if log.is_debug_enabled() {
        for file in &changes.changed_files {
            log.debug(format!("changed: {}", relativizer.to_relative(file, PathKind::Source)));
        }
        for removed in &changes.deleted_files {
            log.debug(format!(
                "deleted: {}",
                relativizer.to_relative(&removed.source_file, PathKind::Source)
            ));
        }
    }
    full
}
