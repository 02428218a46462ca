// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-unit scratch directories and their cleanup.
//!
//! Each unit gets a fresh scratch root holding a temp dir and a profile
//! dir. Removal failures are tolerated: removal is retried a bounded number
//! of times with backoff (some filesystems are slow to release handles),
//! then deferred to a best-effort sweep at the end of the run. Cleanup
//! never fails the suite.

use camino::{Utf8Path, Utf8PathBuf};
use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

const CLEANUP_ATTEMPTS: usize = 5;
const CLEANUP_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Scratch directories for one unit.
#[derive(Clone, Debug)]
pub(crate) struct ScratchDirs {
    pub(crate) base: Utf8PathBuf,
    pub(crate) temp_dir: Utf8PathBuf,
    pub(crate) profile_dir: Utf8PathBuf,
}

pub(crate) fn create_scratch_dirs(root: Option<&Utf8Path>) -> io::Result<ScratchDirs> {
    let builder = {
        let mut builder = camino_tempfile::Builder::new();
        builder.prefix("shelltest-");
        builder
    };
    let base = match root {
        Some(root) => builder.tempdir_in(root)?,
        None => builder.tempdir()?,
    }
    .into_path();

    let temp_dir = base.join("tmp");
    let profile_dir = base.join("profile");
    std::fs::create_dir(&temp_dir)?;
    std::fs::create_dir(&profile_dir)?;

    Ok(ScratchDirs {
        base,
        temp_dir,
        profile_dir,
    })
}

/// Removes a scratch directory, retrying with backoff. A directory that
/// still cannot be removed is pushed onto the deferred list.
pub(crate) async fn cleanup_dir(dir: &Utf8Path, deferred: &CleanupList) {
    let mut delay = CLEANUP_INITIAL_BACKOFF;
    for attempt in 0..CLEANUP_ATTEMPTS {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => return,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return,
            Err(error) => {
                debug!(%dir, %error, attempt, "failed to remove scratch directory, waiting");
            }
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
    deferred.push(dir.to_owned());
}

/// Directories whose removal is deferred to the end of the run.
#[derive(Clone, Debug, Default)]
pub(crate) struct CleanupList {
    inner: Arc<Mutex<Vec<Utf8PathBuf>>>,
}

impl CleanupList {
    pub(crate) fn push(&self, dir: Utf8PathBuf) {
        self.inner
            .lock()
            .expect("cleanup list lock poisoned")
            .push(dir);
    }

    /// Final sweep. Failures here are logged and otherwise ignored: the
    /// machine's temp dir gets cleaned up eventually anyway.
    pub(crate) fn drain_best_effort(&self) {
        let dirs = {
            let mut guard = self.inner.lock().expect("cleanup list lock poisoned");
            std::mem::take(&mut *guard)
        };
        for dir in dirs {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::info!("{dir} could not be cleaned up: {error}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scratch_dirs_create_and_clean_up() {
        let root = camino_tempfile::tempdir().expect("created root");
        let scratch = create_scratch_dirs(Some(root.path())).expect("created scratch");
        assert!(scratch.temp_dir.is_dir());
        assert!(scratch.profile_dir.is_dir());
        assert!(scratch.temp_dir.starts_with(&scratch.base));

        let deferred = CleanupList::default();
        cleanup_dir(&scratch.base, &deferred).await;
        assert!(!scratch.base.exists());

        // Removing an already-removed directory is not an error.
        cleanup_dir(&scratch.base, &deferred).await;
    }

    #[test]
    fn deferred_sweep_tolerates_missing_dirs() {
        let deferred = CleanupList::default();
        deferred.push("/nonexistent/shelltest-scratch".into());
        deferred.drain_best_effort();
    }
}
