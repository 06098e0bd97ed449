//! Output file handling for spawned processes.
//!
//! Each spawned process gets a dedicated pair of files for its standard output
//! and standard error. Names are derived from the process name (`server.out`,
//! `gardener1.err`, ...) and placed in the log directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::errors::LaunchError;

/// Indicates the source stream of a process's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    fn extension(self) -> &'static str {
        match self {
            StreamKind::Stdout => "out",
            StreamKind::Stderr => "err",
        }
    }
}

/// The pair of files a process's streams are redirected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFiles {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl OutputFiles {
    /// Derives `<name>.out` and `<name>.err` inside `log_dir`.
    pub fn for_process(log_dir: &Path, name: &str) -> Self {
        Self {
            stdout: log_dir.join(file_name(name, StreamKind::Stdout)),
            stderr: log_dir.join(file_name(name, StreamKind::Stderr)),
        }
    }

    /// Creates (or truncates) both files, creating parent directories as needed.
    pub fn open(&self) -> Result<(File, File), LaunchError> {
        let stdout = open_truncated(&self.stdout)?;
        let stderr = open_truncated(&self.stderr)?;
        Ok((stdout, stderr))
    }
}

fn file_name(name: &str, stream: StreamKind) -> String {
    format!("{}.{}", name, stream.extension())
}

fn open_truncated(path: &Path) -> Result<File, LaunchError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| LaunchError::OutputFile {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    File::create(path).map_err(|source| LaunchError::OutputFile {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_process_name() {
        let files = OutputFiles::for_process(Path::new("logs"), "gardener2");
        assert_eq!(files.stdout, PathBuf::from("logs/gardener2.out"));
        assert_eq!(files.stderr, PathBuf::from("logs/gardener2.err"));
    }

    #[test]
    fn open_truncates_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let files = OutputFiles::for_process(dir.path(), "server");
        std::fs::write(&files.stdout, "stale output").unwrap();

        let (_out, _err) = files.open().unwrap();

        assert_eq!(std::fs::read_to_string(&files.stdout).unwrap(), "");
        assert!(files.stderr.exists());
    }

    #[test]
    fn open_creates_missing_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("run").join("logs");
        let files = OutputFiles::for_process(&nested, "flowerbed");

        files.open().unwrap();

        assert!(nested.join("flowerbed.out").exists());
        assert!(nested.join("flowerbed.err").exists());
    }
}
