//! Small blocking-filesystem helpers shared by the write, materialization
//! and eviction paths: permission bits (all read-only, owner/group/world
//! write bits cleared, for blobs and whole materialized trees), and tree
//! removal that has to first undo that read-only bit before it can unlink
//! anything. Reaches for `std::os::unix::fs::PermissionsExt` directly rather
//! than a permissions crate, and runs blocking fs work via `spawn_blocking`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn join_err(e: tokio::task::JoinError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

/// Clears the write bits (owner/group/world) on a single file, leaving read
/// (and execute, if already set) bits untouched.
fn readonly_mode(mode: u32) -> u32 {
    mode & !0o222
}

/// Sets the executable bit for owner/group/world; all three, since
/// cache-materialized files have no notion of a separate owner.
fn mode_for(executable: bool) -> u32 {
    if executable {
        0o555
    } else {
        0o444
    }
}

/// Creates a new file at `path` with the permissions a materialized cache
/// blob should have: read-only, optionally executable.
pub async fn create_readonly_file(path: PathBuf, executable: bool) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::File::create(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode_for(executable)))
    })
    .await
    .map_err(join_err)?
}

/// Clears the write bits on an already-written file (used after installing a
/// blob, and after closing a completed write).
pub async fn make_file_readonly(path: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let meta = std::fs::metadata(&path)?;
        let mode = readonly_mode(meta.permissions().mode());
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
    })
    .await
    .map_err(join_err)?
}

/// Recursively clears write bits on every file and directory under `root`,
/// after the tree has been fully materialized.
pub async fn make_tree_readonly(root: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        for entry in walkdir::WalkDir::new(&root).contents_first(true) {
            let entry = entry.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e)
            })?;
            let meta = entry.metadata().map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e)
            })?;
            let mode = readonly_mode(meta.permissions().mode());
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    })
    .await
    .map_err(join_err)?
}

/// Removes a tree that may contain read-only directories (as every fully
/// materialized tree does): directories need their write bit restored
/// before entries inside them can be unlinked.
pub async fn remove_tree(root: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        if !root.exists() {
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(&root) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if entry.file_type().is_dir() {
                let _ = restore_write_bit(entry.path());
            }
        }
        std::fs::remove_dir_all(&root)
    })
    .await
    .map_err(join_err)?
}

fn restore_write_bit(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::metadata(path)?;
    let mode = meta.permissions().mode() | 0o200;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readonly_file_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        create_readonly_file(path.clone(), false).await.unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o444);
    }

    #[tokio::test]
    async fn executable_file_has_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        create_readonly_file(path.clone(), true).await.unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o555);
    }

    #[tokio::test]
    async fn remove_tree_handles_readonly_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("a").join("b");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("f"), b"hi").unwrap();

        make_tree_readonly(dir.path().to_path_buf()).await.unwrap();
        remove_tree(dir.path().to_path_buf()).await.unwrap();
        assert!(!dir.path().exists());
    }
}
