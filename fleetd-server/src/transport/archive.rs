use fleetd_core::config::{GlobalConfig, CONFIG_ENTRYPOINT};
use fleetd_core::error::FleetError;
use flate2::read::GzDecoder;
use std::io::Cursor;
use std::path::PathBuf;
use tar::Archive;
use tracing::{debug, info, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug)]
pub struct ImportOutcome {
    /// Name of the imported project (its directory name).
    pub project: String,
    /// Where a displaced same-name project was moved, if any.
    pub backed_up_to: Option<PathBuf>,
}

/// Validates the blob as an importable archive without extracting it.
pub fn validate(bytes: &[u8], config: &GlobalConfig) -> Result<(), FleetError> {
    if bytes.len() > config.max_import_bytes {
        return Err(FleetError::ArchiveTooLarge {
            size: bytes.len(),
            ceiling: config.max_import_bytes,
        });
    }
    if bytes.len() < 2 || bytes[..2] != GZIP_MAGIC {
        return Err(FleetError::InvalidArchive);
    }
    Ok(())
}

/// Imports a project archive (gzip-compressed tar).
///
/// Extraction goes to a fresh staging directory under the daemon data dir,
/// never into the live projects root. The archive must contain one
/// top-level project directory whose root carries the `fleet-config` entry
/// point; anything else fails `MissingManifest` with the staging directory
/// fully removed. A same-name project already in the fleet is renamed into
/// the backups directory, never deleted.
pub fn import(config: &GlobalConfig, bytes: &[u8]) -> Result<ImportOutcome, FleetError> {
    validate(bytes, config)?;

    let staging_root = config.staging_dir();
    std::fs::create_dir_all(&staging_root)?;
    // TempDir removes the whole staging tree on drop, which is exactly the
    // cleanup every failure path below needs.
    let staging = tempfile::Builder::new()
        .prefix("import-")
        .tempdir_in(&staging_root)?;

    unpack(bytes, staging.path())?;

    let project_dir = find_project_root(staging.path())?;
    let project = project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FleetError::MissingManifest {
            marker: CONFIG_ENTRYPOINT.to_string(),
        })?
        .to_string();

    std::fs::create_dir_all(&config.projects_root)?;
    let destination = config.projects_root.join(&project);

    let mut backed_up_to = None;
    if destination.exists() {
        let backup = fleetd_utils::fs::backup_destination(&config.backups_dir(), &project);
        info!(
            "project {} already exists, moving previous copy to {}",
            project,
            backup.display()
        );
        fleetd_utils::fs::move_dir(&destination, &backup).map_err(io_other)?;
        backed_up_to = Some(backup);
    }

    if let Err(e) = fleetd_utils::fs::move_dir(&project_dir, &destination) {
        // Placing the staged directory failed; put the backup back so the
        // projects root is unchanged by the failed import.
        if let Some(backup) = &backed_up_to {
            if let Err(restore) = fleetd_utils::fs::move_dir(backup, &destination) {
                warn!("could not restore backup {}: {restore:#}", backup.display());
            }
        }
        return Err(io_other(e));
    }

    info!("imported project {} into {}", project, destination.display());
    Ok(ImportOutcome {
        project,
        backed_up_to,
    })
}

/// Unpacks the tar.gz into the staging directory, sanitizing every entry
/// path. An entry escaping the staging root aborts the import.
fn unpack(bytes: &[u8], staging: &std::path::Path) -> Result<(), FleetError> {
    let decoder = GzDecoder::new(Cursor::new(bytes));
    let mut archive = Archive::new(decoder);

    let entries = archive.entries().map_err(|_| FleetError::InvalidArchive)?;
    for entry in entries {
        let mut entry = entry.map_err(|_| FleetError::InvalidArchive)?;
        let path = entry.path().map_err(|_| FleetError::InvalidArchive)?.into_owned();
        let path_str = path.to_string_lossy();

        let target = fleetd_utils::fs::safe_join(staging, &path_str).map_err(io_other)?;

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if !entry_type.is_file() {
            debug!("skipping non-regular archive entry {}", path_str);
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target).map_err(|_| FleetError::InvalidArchive)?;
    }
    Ok(())
}

/// The importable unit is one top-level directory whose root contains the
/// config entry point. Candidates are checked in name order so imports are
/// deterministic.
fn find_project_root(staging: &std::path::Path) -> Result<PathBuf, FleetError> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(staging)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .find(|dir| dir.join(CONFIG_ENTRYPOINT).exists())
        .ok_or_else(|| FleetError::MissingManifest {
            marker: CONFIG_ENTRYPOINT.to_string(),
        })
}

fn io_other(e: anyhow::Error) -> FleetError {
    FleetError::Io(std::io::Error::other(format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Builds a tar.gz with the given (path, content) entries.
    fn archive_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn test_config(root: &std::path::Path) -> GlobalConfig {
        GlobalConfig {
            projects_root: root.join("projects"),
            data_dir: Some(root.join("data")),
            ..Default::default()
        }
    }

    fn tree_snapshot(root: &std::path::Path) -> Vec<PathBuf> {
        fn walk(dir: &std::path::Path, out: &mut Vec<PathBuf>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                out.push(entry.path());
                if entry.path().is_dir() {
                    walk(&entry.path(), out);
                }
            }
        }
        let mut out = Vec::new();
        walk(root, &mut out);
        out.sort();
        out
    }

    #[test]
    fn valid_archive_is_imported() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let bytes = archive_of(&[
            ("demo/fleet-config", b"#!/bin/sh\necho '{}'\n"),
            ("demo/index.html", b"<html></html>"),
            ("demo/src/app.js", b"console.log('hi')"),
        ]);

        let outcome = import(&config, &bytes).unwrap();
        assert_eq!(outcome.project, "demo");
        assert!(outcome.backed_up_to.is_none());
        assert!(config.projects_root.join("demo/fleet-config").exists());
        assert!(config.projects_root.join("demo/src/app.js").exists());
        // Nothing left behind in staging.
        assert!(tree_snapshot(&config.staging_dir()).is_empty());
    }

    #[test]
    fn manifest_less_archive_leaves_no_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir_all(&config.projects_root).unwrap();
        let before = tree_snapshot(&config.projects_root);

        let bytes = archive_of(&[("demo/index.html", b"<html></html>")]);
        let err = import(&config, &bytes).unwrap_err();
        assert!(matches!(err, FleetError::MissingManifest { .. }));

        assert_eq!(tree_snapshot(&config.projects_root), before);
        assert!(tree_snapshot(&config.staging_dir()).is_empty());
    }

    #[test]
    fn oversized_and_malformed_blobs_are_rejected_up_front() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.max_import_bytes = 8;

        let err = import(&config, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, FleetError::ArchiveTooLarge { .. }));

        config.max_import_bytes = 1024;
        let err = import(&config, b"PK\x03\x04not-a-tarball").unwrap_err();
        assert!(matches!(err, FleetError::InvalidArchive));
    }

    #[test]
    fn existing_project_is_backed_up_not_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let existing = config.projects_root.join("demo");
        std::fs::create_dir_all(&existing).unwrap();
        std::fs::write(existing.join("old.txt"), b"previous version").unwrap();

        let bytes = archive_of(&[("demo/fleet-config", b"#!/bin/sh\necho '{}'\n")]);
        let outcome = import(&config, &bytes).unwrap();

        let backup = outcome.backed_up_to.expect("backup path");
        assert!(backup.join("old.txt").exists());
        assert!(!config.projects_root.join("demo/old.txt").exists());
        assert!(config.projects_root.join("demo/fleet-config").exists());
    }

    #[test]
    fn traversal_entries_abort_the_import() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        // tar::Builder itself refuses to write `..` paths, so forge the
        // header name directly, the way a hostile archive would arrive.
        let mut builder = tar::Builder::new(Vec::new());
        let marker: &[u8] = b"#!/bin/sh\necho '{}'\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(marker.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "demo/fleet-config", marker)
            .unwrap();

        let evil: &[u8] = b"should never land";
        let mut header = tar::Header::new_gnu();
        let name = b"demo/../../escape.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(evil.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, evil).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        let bytes = encoder.finish().unwrap();

        assert!(import(&config, &bytes).is_err());
        assert!(!tmp.path().join("escape.txt").exists());
        assert!(tree_snapshot(&config.staging_dir()).is_empty());
    }
}
