// Integration tests for durable upload session storage

use anyhow::Result;
use matchcast::upload::{FileUploadStore, UploadState, UploadStatus, UploadStore};
use tempfile::TempDir;

fn state(upload_id: &str, match_id: &str) -> UploadState {
    UploadState::new(
        upload_id.to_string(),
        match_id.to_string(),
        "final.mp4".to_string(),
        25 * 1024 * 1024,
        5 * 1024 * 1024,
    )
}

#[tokio::test]
async fn test_file_store_round_trip() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = FileUploadStore::open(temp_dir.path()).await?;

    let mut saved = state("upload-a", "match-1");
    saved.acknowledge(0);
    saved.acknowledge(3);
    saved.set_status(UploadStatus::Paused);
    store.save(&saved).await?;

    assert!(temp_dir.path().join("upload-a.json").exists());
    assert!(!temp_dir.path().join("upload-a.json.tmp").exists());

    let loaded = store.load("upload-a").await?.expect("persisted state");
    assert_eq!(loaded, saved);
    assert_eq!(loaded.pending_chunks(), vec![1, 2, 4]);
    Ok(())
}

#[tokio::test]
async fn test_file_store_survives_reopen() -> Result<()> {
    let temp_dir = TempDir::new()?;

    {
        let store = FileUploadStore::open(temp_dir.path()).await?;
        let mut saved = state("upload-b", "match-1");
        saved.acknowledge(1);
        store.save(&saved).await?;
    }

    let store = FileUploadStore::open(temp_dir.path()).await?;
    let loaded = store.load("upload-b").await?.expect("persisted state");
    assert_eq!(loaded.sent_chunks.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_file_store_missing_and_delete() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = FileUploadStore::open(temp_dir.path()).await?;

    assert!(store.load("nothing-here").await?.is_none());

    store.save(&state("upload-c", "match-1")).await?;
    store.delete("upload-c").await?;
    assert!(store.load("upload-c").await?.is_none());

    // Deleting twice is fine
    store.delete("upload-c").await?;
    Ok(())
}

#[tokio::test]
async fn test_file_store_lists_and_skips_garbage() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = FileUploadStore::open(temp_dir.path()).await?;

    store.save(&state("upload-1", "match-1")).await?;
    store.save(&state("upload-2", "match-2")).await?;
    tokio::fs::write(temp_dir.path().join("broken.json"), b"{not json").await?;
    tokio::fs::write(temp_dir.path().join("notes.txt"), b"ignored").await?;

    let states = store.list().await?;
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].upload_id, "upload-1");
    assert_eq!(states[1].upload_id, "upload-2");
    Ok(())
}

#[tokio::test]
async fn test_file_store_rejects_path_like_ids() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = FileUploadStore::open(temp_dir.path()).await?;

    assert!(store.load("../outside").await.is_err());
    assert!(store.save(&state("a/b", "match-1")).await.is_err());
    assert!(store.delete("").await.is_err());
    Ok(())
}
