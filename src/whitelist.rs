use anyhow::{Context, Result};
use regex::Regex;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

/// How a matching sender is handled. Entries without an explicit method
/// on disk count as ALLOW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Allow,
    Swallow,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Allow => "ALLOW",
            Method::Swallow => "SWALLOW",
        }
    }

    fn from_tag(tag: Option<&str>) -> Method {
        match tag {
            Some("SWALLOW") => Method::Swallow,
            _ => Method::Allow,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    pattern: String,
    method: Method,
}

/// Per-recipient allow-lists, one file per recipient under the config
/// directory. Entry lines are `pattern[\tMETHOD]`. A pattern matches a
/// sender when, regex-escaped and anchored at the start, it matches the
/// full sender address or the bare sender domain; the bare-domain form
/// is the wildcard, which is why the pattern language has none.
pub struct Whitelist {
    dir: PathBuf,
}

impl Whitelist {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(&dir)
                .with_context(|| format!("failed to create whitelist dir {}", dir.display()))?;
        }
        Ok(Whitelist { dir })
    }

    fn list_path(&self, recipient: &str) -> PathBuf {
        self.dir.join(recipient)
    }

    fn ensure_list(&self, recipient: &str) -> Result<()> {
        let path = self.list_path(recipient);
        if !path.exists() {
            OpenOptions::new()
                .create(true)
                .write(true)
                .mode(0o640)
                .open(&path)
                .with_context(|| format!("failed to create whitelist {}", path.display()))?;
            log::debug!("created empty whitelist for {recipient}");
        }
        Ok(())
    }

    fn load(&self, recipient: &str) -> Result<Vec<Entry>> {
        let path = self.list_path(recipient);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read whitelist {}", path.display()))?;
        let entries = content
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once('\t') {
                Some((pattern, tag)) => Entry {
                    pattern: pattern.to_string(),
                    method: Method::from_tag(Some(tag)),
                },
                None => Entry {
                    pattern: line.to_string(),
                    method: Method::from_tag(None),
                },
            })
            .collect();
        Ok(entries)
    }

    /// First entry whose pattern prefix-matches the sender address or the
    /// sender domain wins; file order breaks ties. `None` means DENY.
    /// The first query for a recipient creates their empty list.
    pub fn query(
        &self,
        recipient: &str,
        sender: &str,
        sender_domain: &str,
    ) -> Result<Option<Method>> {
        self.ensure_list(recipient)?;
        for entry in self.load(recipient)? {
            let anchored = Regex::new(&format!("^{}", regex::escape(&entry.pattern)))?;
            if anchored.is_match(sender) || anchored.is_match(sender_domain) {
                log::debug!(
                    "whitelist {recipient}: {} matched {} with {}",
                    entry.pattern,
                    sender,
                    entry.method.as_str()
                );
                return Ok(Some(entry.method));
            }
        }
        Ok(None)
    }

    /// Append one entry unless the pattern already resolves to a method.
    /// The existence check pins the query to the pattern itself, so a
    /// broader earlier entry also suppresses the append.
    pub fn add(&self, recipient: &str, pattern: &str, method: Method) -> Result<()> {
        if self.query(recipient, pattern, pattern)?.is_some() {
            log::debug!("whitelist {recipient}: {pattern} already matchable, not adding");
            return Ok(());
        }
        let path = self.list_path(recipient);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o640)
            .open(&path)
            .with_context(|| format!("failed to open whitelist {}", path.display()))?;
        lock_exclusive(&file)
            .with_context(|| format!("failed to lock whitelist {}", path.display()))?;
        writeln!(file, "{}\t{}", pattern, method.as_str())
            .with_context(|| format!("failed to append to whitelist {}", path.display()))?;
        log::info!(
            "whitelist {recipient}: added {pattern} with {}",
            method.as_str()
        );
        Ok(())
    }

    /// Strip every line beginning with the pattern, but only when the
    /// pattern currently resolves to a method. The rewrite goes through a
    /// temp file and rename so a failure leaves the old list intact.
    pub fn remove(&self, recipient: &str, pattern: &str) -> Result<()> {
        if self.query(recipient, pattern, pattern)?.is_none() {
            log::debug!("whitelist {recipient}: {pattern} not matchable, nothing to remove");
            return Ok(());
        }
        let path = self.list_path(recipient);
        let file = File::open(&path)
            .with_context(|| format!("failed to open whitelist {}", path.display()))?;
        lock_exclusive(&file)
            .with_context(|| format!("failed to lock whitelist {}", path.display()))?;

        let content = fs::read_to_string(&path)?;
        let tmp_path = self.dir.join(format!(".{recipient}.tmp"));
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o640)
                .open(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            for line in content.lines().filter(|line| !line.starts_with(pattern)) {
                writeln!(tmp, "{line}")?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to replace whitelist {}", path.display()))?;
        log::info!("whitelist {recipient}: removed {pattern}");
        Ok(())
    }

    /// Entries in file order.
    pub fn dump(&self, recipient: &str) -> Result<Vec<(String, Method)>> {
        self.ensure_list(recipient)?;
        Ok(self
            .load(recipient)?
            .into_iter()
            .map(|entry| (entry.pattern, entry.method))
            .collect())
    }
}

/// Advisory lock held for the lifetime of the file handle; serializes
/// overlapping rewrites of the same recipient list.
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
