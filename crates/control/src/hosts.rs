//! Safe rewriting of the managed region in `/etc/hosts`.
//!
//! The managed region is the span between two marker lines. Every byte
//! outside the markers is preserved verbatim; replacement happens through a
//! temp file renamed over the original so readers never observe a partial
//! file.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tempfile::NamedTempFile;

use crate::engine::NetworkAttachment;

pub const BEGIN_MARKER: &str = "# BEGIN DOCKER CONTAINERS";
pub const END_MARKER: &str = "# END DOCKER CONTAINERS";

const MINIMAL_HOSTS: &str = "127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n";

/// Render one managed-region line: `<ip> <alias> <alias>.<suffix> …` with
/// aliases deduplicated and sorted.
pub fn render_entry(attachment: &NetworkAttachment, suffix: &str) -> String {
    let mut aliases: Vec<&str> = attachment
        .aliases
        .iter()
        .map(String::as_str)
        .filter(|alias| !alias.is_empty())
        .collect();
    aliases.sort_unstable();
    aliases.dedup();

    let mut line = attachment.ip.clone();
    for alias in aliases {
        line.push(' ');
        line.push_str(alias);
        line.push(' ');
        line.push_str(alias);
        line.push('.');
        line.push_str(suffix);
    }
    line
}

/// Replace the managed region of `content` with `lines`, preserving every
/// byte outside the markers.
pub fn splice_managed_region(content: &str, lines: &[String]) -> Result<String> {
    let mut out = String::with_capacity(content.len() + lines.len() * 64);
    let mut inside = false;
    let mut seen_begin = false;
    let mut seen_end = false;

    for line in content.split_inclusive('\n') {
        let text = line.strip_suffix('\n').unwrap_or(line);
        if !inside {
            out.push_str(line);
            if text == BEGIN_MARKER {
                seen_begin = true;
                inside = true;
                if !line.ends_with('\n') {
                    out.push('\n');
                }
                for entry in lines {
                    out.push_str(entry);
                    out.push('\n');
                }
            }
        } else if text == END_MARKER {
            inside = false;
            seen_end = true;
            out.push_str(line);
        }
        // Lines between the markers are the old managed content; dropped.
    }

    if inside {
        bail!("hosts file has a BEGIN marker but no END marker");
    }
    if !seen_begin || !seen_end {
        bail!("hosts file is missing the managed region markers");
    }
    Ok(out)
}

/// Structure checks applied before a new hosts file is moved into place.
/// An empty managed region is fine; a file without localhost entries is not.
pub fn validate(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        bail!("generated hosts file is completely empty");
    }
    if !content.contains("127.0.0.1") && !content.contains("::1") {
        bail!("generated hosts file is missing required localhost entries");
    }
    match (content.find(BEGIN_MARKER), content.find(END_MARKER)) {
        (Some(begin), Some(end)) if begin < end => Ok(()),
        (Some(_), Some(_)) => bail!("hosts file has its END marker before the BEGIN marker"),
        (Some(_), None) => bail!("hosts file has a BEGIN marker but no END marker"),
        (None, Some(_)) => bail!("hosts file has an END marker but no BEGIN marker"),
        (None, None) => Ok(()),
    }
}

/// Manages a hosts file with backups and atomic replacement.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
    backup_path: PathBuf,
    suffix: String,
}

impl HostsFile {
    pub fn new(
        path: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            backup_path: backup_path.into(),
            suffix: suffix.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create_backup(&self) -> Result<()> {
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path).with_context(|| {
                format!("Failed to back up hosts file to {}", self.backup_path.display())
            })?;
            tracing::debug!("Backup created: {}", self.backup_path.display());
        }
        Ok(())
    }

    /// Put the backup back in place. Returns false when no backup exists.
    pub fn restore_backup(&self) -> Result<bool> {
        if !self.backup_path.exists() {
            return Ok(false);
        }
        fs::copy(&self.backup_path, &self.path).with_context(|| {
            format!("Failed to restore hosts file from {}", self.backup_path.display())
        })?;
        tracing::info!("Restored hosts file from backup");
        Ok(true)
    }

    /// Make sure the hosts file exists: restore the backup, or write a
    /// minimal localhost file as a last resort.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        tracing::error!("{} does not exist", self.path.display());
        if self.restore_backup()? {
            return Ok(());
        }
        tracing::info!("Creating minimal hosts file");
        fs::write(&self.path, MINIMAL_HOSTS)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        Ok(())
    }

    /// Normalize single-byte non-breaking spaces left behind by hand edits.
    pub fn fix_non_breaking_spaces(&self) -> Result<()> {
        let mut bytes = fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if !bytes.contains(&0xA0) {
            return Ok(());
        }
        self.create_backup()?;
        for byte in &mut bytes {
            if *byte == 0xA0 {
                *byte = b' ';
            }
        }
        fs::write(&self.path, bytes)
            .with_context(|| format!("Failed to rewrite {}", self.path.display()))?;
        Ok(())
    }

    /// Append the marker pair when the file has never carried a managed
    /// region.
    pub fn ensure_managed_region(&self) -> Result<()> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if content.contains(BEGIN_MARKER) && content.contains(END_MARKER) {
            return Ok(());
        }
        tracing::info!("Appending managed section markers to {}", self.path.display());
        self.create_backup()?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {} for append", self.path.display()))?;
        writeln!(file, "\n{BEGIN_MARKER}\n{END_MARKER}")
            .context("Failed to append managed section markers")?;
        Ok(())
    }

    /// Rewrite the managed region with one line per attachment. Returns the
    /// number of entries written.
    pub fn apply(&self, attachments: &[NetworkAttachment]) -> Result<usize> {
        if let Err(err) = self.create_backup() {
            tracing::warn!("Could not create backup, proceeding with caution: {err:#}");
        }

        if !self.path.exists() && !self.restore_backup()? {
            bail!(
                "{} is missing and no backup is available",
                self.path.display()
            );
        }

        let current = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let lines: Vec<String> = attachments
            .iter()
            .map(|attachment| render_entry(attachment, &self.suffix))
            .collect();

        let result = self.replace_with(&current, &lines);
        if result.is_err() {
            // If the rewrite left the live file missing or empty, put the
            // backup back before reporting the failure.
            let damaged = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
            if damaged {
                tracing::warn!("Main hosts file is missing or empty, attempting restore");
                if let Err(err) = self.restore_backup() {
                    tracing::error!("Failed to restore hosts file from backup: {err:#}");
                }
            }
        }
        result.map(|()| lines.len())
    }

    fn replace_with(&self, current: &str, lines: &[String]) -> Result<()> {
        let next = splice_managed_region(current, lines)?;
        validate(&next)?;

        let dir = self
            .path
            .parent()
            .context("hosts path has no parent directory")?;
        // The temp file lives in the same directory so the final rename
        // stays within one filesystem. It is discarded on any failure.
        let mut tmp = NamedTempFile::new_in(dir)
            .context("Failed to create temporary file for hosts update")?;
        tmp.write_all(next.as_bytes())
            .context("Failed to write new hosts content")?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .context("Failed to set permissions on new hosts file")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to move new hosts file over {}", self.path.display()))?;
        Ok(())
    }
}
