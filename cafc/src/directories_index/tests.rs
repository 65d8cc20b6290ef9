//! All three backends MUST be behaviorally interchangeable: the same
//! scripted sequence of operations against each should produce the same
//! observable results.

use super::*;
use crate::digest::Digest;
use crate::key::BlobKey;

fn digest(hash: &str, size: u64) -> Digest {
    Digest::build(hash, size).unwrap()
}

fn blob_key(hash: &str, size: u64) -> BlobKey {
    BlobKey::new(&digest(hash, size), false)
}

async fn exercise(index: &dyn DirectoriesIndex) {
    let dir_a = digest("a".repeat(64).as_str(), 100);
    let dir_b = digest("b".repeat(64).as_str(), 200);
    let key_1 = blob_key("1".repeat(64).as_str(), 10);
    let key_2 = blob_key("2".repeat(64).as_str(), 20);

    // Empty index has no entries.
    assert!(index.directory_entries(&dir_a).await.unwrap().is_empty());

    // Two directories, one shared blob key.
    index
        .put(dir_a.clone(), vec![key_1.clone(), key_2.clone()])
        .await
        .unwrap();
    index.put(dir_b.clone(), vec![key_1.clone()]).await.unwrap();

    assert_eq!(
        index.directory_entries(&dir_a).await.unwrap(),
        vec![key_1.clone(), key_2.clone()]
    );
    assert_eq!(
        index.directory_entries(&dir_b).await.unwrap(),
        vec![key_1.clone()]
    );

    // Removing key_1's entry reports both directories that reference it.
    let mut affected = index.remove_entry(&key_1).await.unwrap();
    affected.sort();
    let mut expected = vec![dir_a.clone(), dir_b.clone()];
    expected.sort();
    assert_eq!(affected, expected);

    // Re-querying key_1 now returns nothing to remove.
    assert!(index.remove_entry(&key_1).await.unwrap().is_empty());

    // Removing a directory directly also clears its entries.
    index.remove(&dir_a).await.unwrap();
    assert!(index.directory_entries(&dir_a).await.unwrap().is_empty());
    assert!(index.remove_entry(&key_2).await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_backend() {
    let index = MemoryDirectoriesIndex::new();
    index.start().await.unwrap();
    exercise(&index).await;
    index.close().await.unwrap();
}

#[tokio::test]
async fn file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let index = FileDirectoriesIndex::new(dir.path());
    index.start().await.unwrap();
    exercise(&index).await;
    index.close().await.unwrap();
}

#[tokio::test]
async fn sqlite_backend() {
    let index = SqliteDirectoriesIndex::new_in_memory().unwrap();
    index.start().await.unwrap();
    exercise(&index).await;
    index.close().await.unwrap();
}

#[tokio::test]
async fn file_backend_rebuilds_inverse_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let dir_a = digest("a".repeat(64).as_str(), 100);
    let key_1 = blob_key("1".repeat(64).as_str(), 10);

    {
        let index = FileDirectoriesIndex::new(dir.path());
        index.start().await.unwrap();
        index.put(dir_a.clone(), vec![key_1.clone()]).await.unwrap();
        index.close().await.unwrap();
    }

    // A fresh instance over the same root re-derives the inverse map.
    let index = FileDirectoriesIndex::new(dir.path());
    index.start().await.unwrap();
    let affected = index.remove_entry(&key_1).await.unwrap();
    assert_eq!(affected, vec![dir_a]);
}

#[test]
fn file_backend_owns_its_entries_files_not_blobs() {
    let index = FileDirectoriesIndex::new("/unused");
    assert!(index.owns_path(&format!("{}_100_dir_entries", "a".repeat(64))));
    assert!(!index.owns_path(&format!("{}_100", "a".repeat(64))));
    assert!(!index.owns_path(&format!("{}_100_dir", "a".repeat(64))));
}

#[test]
fn sqlite_backend_owns_only_its_own_db_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("directories.sqlite");
    let index = SqliteDirectoriesIndex::new(path).unwrap();
    assert!(index.owns_path("directories.sqlite"));
    assert!(!index.owns_path("other.sqlite"));
}
