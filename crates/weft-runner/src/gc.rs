//! Intermediate file cleanup.
//!
//! Once every consumer of a non-persistent file has succeeded, its content is
//! cleared on disk and the file is flagged as deleted. The record itself is
//! kept so provenance survives.

use crate::error::{EngineError, Result};
use std::path::Path;
use walkdir::WalkDir;
use weft_core::model::{Status, Task, TaskFile};
use weft_core::store::Repository;

/// Clears the inputs of `task` that no other pending task still needs.
/// Returns the files that were cleared.
pub fn collect_intermediates<R: Repository + ?Sized>(
    repo: &mut R,
    task: &Task,
) -> Result<Vec<TaskFile>> {
    let mut cleared = Vec::new();
    for mut file in repo.task_files(&task.input_files)? {
        if file.persist || file.deleted {
            continue;
        }
        let mut all_done = true;
        for consumer in repo.consumers_of(file.id)? {
            if repo.task(consumer)?.status != Status::Successful {
                all_done = false;
                break;
            }
        }
        if !all_done {
            tracing::trace!("{} ({}) still has pending consumers", file.id, file.path.display());
            continue;
        }

        clear_path(&file.path)?;
        file.deleted = true;
        repo.update_task_file(&file)?;
        tracing::info!("Deleted intermediate file {}", file.path.display());
        cleared.push(file);
    }
    Ok(cleared)
}

/// Truncates a file, or empties a directory while keeping the directory
/// itself. Missing paths are left alone.
pub fn clear_path(path: &Path) -> Result<()> {
    if !path.exists() {
        tracing::debug!("{} does not exist, nothing to clear", path.display());
        return Ok(());
    }
    if path.is_file() {
        fs_err::File::create(path).map_err(EngineError::io(path))?;
        return Ok(());
    }
    for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| EngineError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        let child = entry.path();
        if entry.file_type().is_dir() {
            fs_err::remove_dir_all(child).map_err(EngineError::io(child))?;
        } else {
            fs_err::remove_file(child).map_err(EngineError::io(child))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_clear_path_empties_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("index");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.idx"), "aaaa").unwrap();
        fs::write(root.join("sub/b.idx"), "bbbb").unwrap();

        clear_path(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_path_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let bam = dir.path().join("s1.bam");
        fs::write(&bam, "reads").unwrap();

        clear_path(&bam).unwrap();
        assert!(bam.exists());
        assert_eq!(fs::metadata(&bam).unwrap().len(), 0);
    }

    #[test]
    fn test_clear_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        clear_path(&dir.path().join("nope")).unwrap();
    }
}
