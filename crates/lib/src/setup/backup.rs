//! Config-file backups and volume export/import as gzip tarballs.

use anyhow::{bail, Context, Result};
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use futures_util::Stream;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;

/// `<path>.bak-<timestamp>` (colons avoided so the name is valid everywhere).
pub fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".bak-{}", now.format("%Y-%m-%dT%H-%M-%S%.3fZ")));
    PathBuf::from(name)
}

/// Write `content` to `path`, first copying any existing file to a timestamped backup.
/// Returns the backup path when one was made.
pub async fn save_with_backup(path: &Path, content: &str) -> Result<Option<PathBuf>> {
    let backup = if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let backup = backup_path(path, Utc::now());
        tokio::fs::copy(path, &backup)
            .await
            .with_context(|| format!("backing up {}", path.display()))?;
        log::info!("backed up {} to {}", path.display(), backup.display());
        Some(backup)
    } else {
        None
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(backup)
}

pub fn export_file_name(now: DateTime<Utc>) -> String {
    format!("openclaw-export-{}.tar.gz", now.format("%Y-%m-%dT%H-%M-%SZ"))
}

/// Name of `dir` inside the archive: relative to the volume root when possible.
fn archive_name(dir: &Path, volume_root: &Path) -> PathBuf {
    match dir.strip_prefix(volume_root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => dir
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data")),
    }
}

/// Directories to export; a workspace nested inside the state dir is covered by the state dir.
fn export_roots(state_dir: &Path, workspace_dir: &Path) -> Vec<PathBuf> {
    let mut roots = vec![state_dir.to_path_buf()];
    if !workspace_dir.starts_with(state_dir) {
        roots.push(workspace_dir.to_path_buf());
    }
    roots
}

/// Forwards encoder output into a channel; the async side turns it into a response body.
struct ChannelWriter {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "export client went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn write_archive(
    writer: ChannelWriter,
    roots: &[PathBuf],
    volume_root: &Path,
) -> std::io::Result<()> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    for dir in roots {
        if !dir.is_dir() {
            continue;
        }
        builder.append_dir_all(archive_name(dir, volume_root), dir)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Stream a `.tar.gz` of the state and workspace directories. Tar building runs on a blocking
/// thread; a failure part-way ends the stream with an error.
pub fn export_stream(
    state_dir: PathBuf,
    workspace_dir: PathBuf,
    volume_root: PathBuf,
) -> impl Stream<Item = std::io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
    tokio::task::spawn_blocking(move || {
        let roots = export_roots(&state_dir, &workspace_dir);
        let writer = ChannelWriter { tx: tx.clone() };
        if let Err(e) = write_archive(writer, &roots, &volume_root) {
            log::warn!("export failed: {}", e);
            let _ = tx.blocking_send(Err(e));
        }
    });
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

/// Reject anything that could leave the extraction root.
pub fn sanitize_entry_path(path: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("archive contains unsafe path: {}", path.display());
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(clean))
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ImportReport {
    pub files: usize,
    pub skipped: usize,
}

/// Check every entry path before anything is written.
fn validate_archive(bytes: &[u8]) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries().context("reading archive")? {
        let entry = entry.context("reading archive entry")?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            continue;
        }
        sanitize_entry_path(&entry.path()?)?;
    }
    Ok(())
}

/// Extract a gzip tarball under `root`. Links are skipped; an unsafe path anywhere in the
/// archive aborts the import before any file is written.
pub fn import_archive(bytes: &[u8], root: &Path) -> Result<ImportReport> {
    validate_archive(bytes)?;
    std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    let canonical_root = std::fs::canonicalize(root)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut report = ImportReport::default();
    for entry in archive.entries().context("reading archive")? {
        let mut entry = entry.context("reading archive entry")?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            log::warn!("import: skipping link entry {}", entry.path()?.display());
            report.skipped += 1;
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(rel) = sanitize_entry_path(&path)? else {
            continue;
        };
        let dest = canonical_root.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
            if !std::fs::canonicalize(parent)?.starts_with(&canonical_root) {
                bail!("archive entry escapes the volume: {}", path.display());
            }
        }
        if let Ok(meta) = std::fs::symlink_metadata(&dest) {
            if meta.file_type().is_symlink() {
                bail!("archive entry targets a symlink: {}", path.display());
            }
        }
        if kind.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if !kind.is_file() {
            report.skipped += 1;
            continue;
        }
        entry
            .unpack(&dest)
            .with_context(|| format!("unpacking {}", path.display()))?;
        report.files += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures_util::StreamExt;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("clawhost-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn backup_name_has_timestamp() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let p = backup_path(Path::new("/data/.openclaw/openclaw.json"), now);
        assert_eq!(
            p,
            PathBuf::from("/data/.openclaw/openclaw.json.bak-2026-01-02T03-04-05.000Z")
        );
    }

    #[tokio::test]
    async fn save_backs_up_previous_content() {
        let dir = temp_dir("backup");
        let path = dir.join("openclaw.json");
        assert_eq!(save_with_backup(&path, "{\"a\":1}").await.unwrap(), None);
        let backup = save_with_backup(&path, "{\"a\":2}").await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "{\"a\":1}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_entry_path(Path::new("../etc/passwd")).is_err());
        assert!(sanitize_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(sanitize_entry_path(Path::new("a/../../b")).is_err());
        assert_eq!(
            sanitize_entry_path(Path::new("./.openclaw/openclaw.json")).unwrap(),
            Some(PathBuf::from(".openclaw/openclaw.json"))
        );
        assert_eq!(sanitize_entry_path(Path::new(".")).unwrap(), None);
    }

    #[tokio::test]
    async fn export_then_import_restores_files() {
        let src = temp_dir("export");
        std::fs::create_dir_all(src.join(".openclaw")).unwrap();
        std::fs::create_dir_all(src.join("workspace/notes")).unwrap();
        std::fs::write(src.join(".openclaw/openclaw.json"), "{}").unwrap();
        std::fs::write(src.join("workspace/notes/a.md"), "hello").unwrap();

        let chunks: Vec<_> = export_stream(src.join(".openclaw"), src.join("workspace"), src.clone())
            .collect()
            .await;
        let mut archive = Vec::new();
        for c in chunks {
            archive.extend_from_slice(&c.unwrap());
        }

        let dst = temp_dir("import");
        let report = import_archive(&archive, &dst).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(std::fs::read_to_string(dst.join("workspace/notes/a.md")).unwrap(), "hello");
        assert!(dst.join(".openclaw/openclaw.json").is_file());
        let _ = std::fs::remove_dir_all(&src);
        let _ = std::fs::remove_dir_all(&dst);
    }

    #[cfg(unix)]
    #[test]
    fn import_skips_symlinks() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "evil", "../outside")
            .unwrap();
        let data = b"ok";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "workspace/file.txt", &data[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let dst = temp_dir("import-links");
        let report = import_archive(&bytes, &dst).unwrap();
        assert_eq!(report, ImportReport { files: 1, skipped: 1 });
        assert!(std::fs::symlink_metadata(dst.join("evil")).is_err());
        let _ = std::fs::remove_dir_all(&dst);
    }

    #[test]
    fn traversal_anywhere_aborts_before_writing() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let data = b"first";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "workspace/first.txt", &data[..])
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        // append_data refuses "..", so write the raw name into the header.
        header.as_gnu_mut().unwrap().name[..11].copy_from_slice(b"../evil.txt");
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let dst = temp_dir("import-traversal");
        let err = import_archive(&bytes, &dst).unwrap_err();
        assert!(err.to_string().contains("unsafe path"));
        assert!(!dst.join("workspace/first.txt").exists());
        assert!(!dst.join("workspace").exists());
        let _ = std::fs::remove_dir_all(&dst);
    }
}
