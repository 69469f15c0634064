use anyhow::{anyhow, Result};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Joins `relative` onto `root`, rejecting absolute paths and any `..`
/// component. Used for archive entry paths, which are attacker-supplied.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = relative.trim_start_matches('/');
    let path = Path::new(relative);

    let mut out = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!("path escapes extraction root: {relative}"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("absolute path in archive: {relative}"));
            }
        }
    }
    Ok(out)
}

/// Destination for a displaced project directory: `<backups>/<name>.<ts>`.
pub fn backup_destination(backups_dir: &Path, name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    backups_dir.join(format!("{name}.{ts}"))
}

/// Moves a directory, falling back to copy-and-remove when the rename
/// crosses a filesystem boundary.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_all(src, dst)?;
            std::fs::remove_dir_all(src)?;
            Ok(())
        }
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
