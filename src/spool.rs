use anyhow::{Context, Result};
use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Learning-mode markers, one zero-length file per recipient. The marker
/// mtime is the moment learning began; a marker older than the learning
/// period counts as absent. Stale markers are never reaped here; the
/// command that ends learning deletes the marker it consumed.
pub struct LearningSpool {
    dir: PathBuf,
    period: Duration,
}

impl LearningSpool {
    pub fn open(dir: impl Into<PathBuf>, period_secs: u64) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(&dir)
                .with_context(|| format!("failed to create spool dir {}", dir.display()))?;
        }
        Ok(LearningSpool {
            dir,
            period: Duration::from_secs(period_secs),
        })
    }

    fn marker_path(&self, recipient: &str) -> PathBuf {
        self.dir.join(recipient)
    }

    pub fn is_learning(&self, recipient: &str) -> Result<bool> {
        self.is_learning_at(recipient, SystemTime::now())
    }

    fn is_learning_at(&self, recipient: &str, now: SystemTime) -> Result<bool> {
        let path = self.marker_path(recipient);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat marker {}", path.display()))
            }
        };
        let begun = metadata
            .modified()
            .with_context(|| format!("failed to read mtime of {}", path.display()))?;
        // A marker from the future (clock step) still counts as fresh.
        let age = now.duration_since(begun).unwrap_or(Duration::ZERO);
        Ok(age < self.period)
    }

    /// Create or refresh the marker; a repeated learn restarts the window.
    pub fn begin_learning(&self, recipient: &str) -> Result<()> {
        let path = self.marker_path(recipient);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o640)
            .open(&path)
            .with_context(|| format!("failed to touch marker {}", path.display()))?;
        file.set_modified(SystemTime::now())
            .with_context(|| format!("failed to refresh marker {}", path.display()))?;
        log::info!("learning mode started for {recipient}");
        Ok(())
    }

    pub fn end_learning(&self, recipient: &str) -> Result<()> {
        let path = self.marker_path(recipient);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!("learning mode ended for {recipient}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove marker {}", path.display()))
            }
        }
    }
}
