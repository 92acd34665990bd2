//! End-to-end synchronization rounds against an in memory server

mod common;

use anyhow::{Context, Result};
use md5::{Digest, Md5};

use ndrive::index::{FsEvent, PairState, SideState, Transfer};
use ndrive::sync::EngineEvent;

use common::{drain_events, TestDrive};

#[tokio::test]
async fn test_new_local_file_is_uploaded() -> Result<()> {
    let mut drive = TestDrive::new().await?;
    std::fs::write(drive.local_path("/Workspace/report.txt"), b"hello\n")?;

    drive.scan_local().await?;
    assert_eq!(
        drive.pair("/Workspace/report.txt")?.pair_state,
        PairState::LocallyCreated
    );
    drive.process().await?;

    let pair = drive.pair("/Workspace/report.txt")?;
    assert_eq!(pair.pair_state, PairState::Synchronized);
    assert_eq!(pair.remote_name.as_deref(), Some("report.txt"));
    assert_eq!(pair.last_transfer, Some(Transfer::Upload));

    let expected = hex::encode(Md5::digest(b"hello\n"));
    assert_eq!(expected, "b1946ac92492d2347c6235b4d2611184");
    assert_eq!(pair.local_digest.as_deref(), Some(expected.as_str()));
    assert_eq!(pair.remote_digest, pair.local_digest);

    let remote_ref = pair.remote_ref.clone().context("the file was not bound")?;
    assert_eq!(
        drive.engine.local().get_remote_id("/Workspace/report.txt"),
        Some(remote_ref.clone())
    );
    assert_eq!(drive.remote.content(&remote_ref), Some(b"hello\n".to_vec()));
    assert_eq!(
        drive.remote.item(&remote_ref).context("missing on the server")?.parent_uid,
        Some(drive.workspace.uid.clone())
    );
    Ok(())
}

#[tokio::test]
async fn test_remote_tree_then_local_folder_rename() -> Result<()> {
    let mut drive = TestDrive::new().await?;
    let folder = drive.remote.create_folder_remotely(&drive.workspace.uid, "A")?;
    let file = drive.remote.create_file_remotely(&folder.uid, "b.txt", b"x")?;

    drive.poll_remote().await?;
    drive.process().await?;
    assert_eq!(std::fs::read(drive.local_path("/Workspace/A/b.txt"))?, b"x");
    let version = drive.pair("/Workspace/A")?.version;

    let from = drive.local_path("/Workspace/A");
    let to = drive.local_path("/Workspace/A2");
    std::fs::rename(&from, &to)?;
    drive.local_events(&[FsEvent::Moved { from, to }])?;
    drive.process().await?;

    let a = drive.pair("/Workspace/A2")?;
    assert_eq!(a.pair_state, PairState::Synchronized);
    assert_eq!(a.remote_name.as_deref(), Some("A2"));
    assert!(a.version > version);
    assert_eq!(
        drive.remote.item(&folder.uid).context("folder gone")?.name,
        "A2"
    );

    let b = drive.pair("/Workspace/A2/b.txt")?;
    assert_eq!(b.pair_state, PairState::Synchronized);
    assert_eq!(b.remote_ref.as_deref(), Some(file.uid.as_str()));
    assert_eq!(b.remote_parent_path, Some(a.remote_path()));
    assert_eq!(
        drive.remote.item(&file.uid).context("file gone")?.parent_uid,
        Some(folder.uid.clone())
    );
    assert!(!drive.local_path("/Workspace/A/b.txt").exists());
    assert!(drive.engine.store().get_state_from_local("/Workspace/A")?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_identical_concurrent_edit_is_resolved() -> Result<()> {
    let mut drive = TestDrive::new().await?;
    // Same size as the final content so the local change is not taken for a copy
    let doc = drive
        .remote
        .create_file_remotely(&drive.workspace.uid, "doc.txt", b"old!")?;
    drive.poll_remote().await?;
    drive.process().await?;
    assert_eq!(drive.pair("/Workspace/doc.txt")?.pair_state, PairState::Synchronized);
    let mut rx = drive.engine.subscribe();

    drive.remote.update_file_remotely(&doc.uid, b"same")?;
    drive.poll_remote().await?;
    assert_eq!(
        drive.pair("/Workspace/doc.txt")?.pair_state,
        PairState::RemotelyModified
    );

    let path = drive.local_path("/Workspace/doc.txt");
    std::fs::write(&path, b"same")?;
    drive.local_events(&[FsEvent::Modified(path.clone())])?;
    assert_eq!(drive.pair("/Workspace/doc.txt")?.pair_state, PairState::Conflicted);

    drive.process().await?;
    let pair = drive.pair("/Workspace/doc.txt")?;
    assert_eq!(pair.pair_state, PairState::Synchronized);
    assert_eq!(pair.local_digest, pair.remote_digest);
    assert_eq!(std::fs::read(&path)?, b"same");
    assert_eq!(drive.remote.content(&doc.uid), Some(b"same".to_vec()));
    assert_eq!(drive.remote.upload_count(), 0);
    assert!(!drain_events(&mut rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::NewConflict { .. })));
    Ok(())
}

#[tokio::test]
async fn test_move_into_readonly_folder_is_unsynchronized() -> Result<()> {
    let mut drive = TestDrive::new().await?;
    let a = drive.remote.create_folder_remotely(&drive.workspace.uid, "A")?;
    let b = drive.remote.create_folder_remotely(&drive.workspace.uid, "B")?;
    drive.remote.set_readonly_remotely(&b.uid, true)?;
    drive.poll_remote().await?;
    drive.process().await?;
    assert!(!drive.pair("/Workspace/B")?.remote_can_create_child);

    let x_path = drive.local_path("/Workspace/A/x");
    std::fs::write(&x_path, b"x")?;
    drive.local_events(&[FsEvent::Created(x_path.clone())])?;
    drive.process().await?;
    let x = drive.pair("/Workspace/A/x")?;
    assert_eq!(x.pair_state, PairState::Synchronized);
    let remote_x = x.remote_ref.clone().context("x was not uploaded")?;

    let mut rx = drive.engine.subscribe();
    drive.engine.local().move_to("/Workspace/A/x", "/Workspace/B", None)?;
    drive.local_events(&[FsEvent::Moved {
        from: x_path,
        to: drive.local_path("/Workspace/B/x"),
    }])?;
    drive.process().await?;

    let x = drive.pair("/Workspace/B/x")?;
    assert_eq!(x.pair_state, PairState::Unsynchronized);
    assert!(drive.local_path("/Workspace/B/x").exists());
    let remote = drive.remote.item(&remote_x).context("x gone from the server")?;
    assert_eq!(remote.parent_uid.as_deref(), Some(a.uid.as_str()));
    assert!(drive.remote.children_of(&b.uid).is_empty());
    assert!(drain_events(&mut rx).contains(&EngineEvent::NewReadonly {
        filename: "x".to_string(),
        parent: Some("B".to_string()),
    }));
    Ok(())
}

#[tokio::test]
async fn test_move_then_copy_back_creates_a_new_document() -> Result<()> {
    let mut drive = TestDrive::new().await?;
    let foo = drive.local_path("/Workspace/foo.txt");
    let bar = drive.local_path("/Workspace/bar.txt");
    std::fs::write(&foo, b"foo")?;
    drive.local_events(&[FsEvent::Created(foo.clone())])?;
    drive.process().await?;
    let original = drive.pair("/Workspace/foo.txt")?;
    let remote_ref = original.remote_ref.clone().context("foo.txt was not uploaded")?;

    // The copy carries the metadata of its source
    std::fs::rename(&foo, &bar)?;
    std::fs::copy(&bar, &foo)?;
    drive.engine.local().set_remote_id("/Workspace/foo.txt", &remote_ref)?;
    drive.local_events(&[
        FsEvent::Moved {
            from: foo.clone(),
            to: bar.clone(),
        },
        FsEvent::Created(foo.clone()),
    ])?;

    let moved = drive.pair("/Workspace/bar.txt")?;
    assert_eq!(moved.id, original.id);
    assert_eq!(moved.local_state, SideState::Moved);
    let copy = drive.pair("/Workspace/foo.txt")?;
    assert_ne!(copy.id, original.id);
    assert_eq!(copy.pair_state, PairState::LocallyCreated);
    assert!(drive.engine.local().get_remote_id("/Workspace/foo.txt").is_none());

    drive.process().await?;
    let moved = drive.pair("/Workspace/bar.txt")?;
    assert_eq!(moved.pair_state, PairState::Synchronized);
    assert_eq!(moved.remote_ref.as_deref(), Some(remote_ref.as_str()));
    assert_eq!(
        drive.remote.item(&remote_ref).context("original gone")?.name,
        "bar.txt"
    );

    let copy = drive.pair("/Workspace/foo.txt")?;
    assert_eq!(copy.pair_state, PairState::Synchronized);
    let copy_ref = copy.remote_ref.clone().context("the copy was not uploaded")?;
    assert_ne!(copy_ref, remote_ref);
    let remote_copy = drive
        .remote_child(None, "foo.txt")
        .context("no foo.txt on the server")?;
    assert_eq!(remote_copy.uid, copy_ref);
    assert_eq!(drive.remote.content(&copy_ref), Some(b"foo".to_vec()));
    Ok(())
}
