use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::StorageError;
use crate::job::JobId;
use crate::pipeline::GeneratedFile;
use crate::sanitize::redact_path;

/// Checks that `path` stays inside the directory it is joined to.
fn relative_path(path: &str) -> Result<&Path, StorageError> {
    let invalid = |reason: &str| StorageError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.trim().is_empty() {
        return Err(invalid("empty path"));
    }
    let candidate = Path::new(path);
    let mut has_name = false;
    for component in candidate.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path escapes the output directory")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("absolute paths are not allowed"))
            }
        }
    }
    if !has_name {
        return Err(invalid("no file name"));
    }
    Ok(candidate)
}

/// Writes approved conversion output below `output_directory/<job id>/`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    output_directory: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(output_directory: P) -> Self {
        Self {
            output_directory: output_directory.as_ref().to_path_buf(),
        }
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    pub fn job_directory(&self, job_id: &JobId) -> PathBuf {
        self.output_directory.join(job_id.as_str())
    }

    /// Stores every generated file and returns the job's output directory.
    ///
    /// All paths are checked before anything is written. Existing files are
    /// never overwritten.
    pub fn store_output(
        &self,
        job_id: &JobId,
        files: &[GeneratedFile],
    ) -> Result<PathBuf, StorageError> {
        let relative: Vec<&Path> = files
            .iter()
            .map(|f| relative_path(&f.path))
            .collect::<Result<_, _>>()?;

        let job_dir = self.job_directory(job_id);
        self.ensure_directory(&job_dir)?;

        for (file, rel) in files.iter().zip(relative) {
            let target = job_dir.join(rel);
            if let Some(parent) = target.parent() {
                self.ensure_directory(parent)?;
            }
            Self::write_new(&target, file.content.as_bytes())?;
            log::debug!("Wrote {} for job {}", redact_path(rel), job_id);
        }

        log::info!(
            "Stored {} generated files for job {} in {}",
            files.len(),
            job_id,
            job_dir.display()
        );
        Ok(job_dir)
    }

    fn write_new(path: &Path, content: &[u8]) -> Result<(), StorageError> {
        // create_new is an atomic check-and-create
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::FileExists(path.to_path_buf()));
            }
            Err(e) => {
                return Err(StorageError::WriteFile {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        file.write_all(content).map_err(|e| StorageError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}
