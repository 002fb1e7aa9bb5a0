//! End-to-end transfer tests over loopback TCP.
//!
//! Each test starts its own server on an ephemeral port and drives it with
//! the public client API.

mod common;

use common::*;
use qback_core::hash::hash_bytes;
use qback_core::storage::is_part_file;
use qback_core::transfer::UploadOutcome;
use qback_core::Error;

fn part_files(dir: &std::path::Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| is_part_file(name))
        .collect()
}

#[tokio::test]
async fn test_upload_download_round_trip() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;

    let content = random_bytes(10_000);
    let source = create_test_file(work.path(), "data.bin", &content);

    let client = client_for(server.addr, None, 1024);
    let outcome = client
        .upload("backups", source.to_str().unwrap())
        .await
        .unwrap();

    match &outcome {
        UploadOutcome::Completed {
            name,
            message,
            bytes,
            ..
        } => {
            assert_eq!(name, "data.bin");
            assert_eq!(message, "Receive complete");
            assert_eq!(*bytes, 10_000);
        }
        UploadOutcome::Rejected { message } => panic!("upload rejected: {message}"),
    }

    let stored = storage.path().join("backups").join("data.bin");
    assert_files_equal(&source, &stored);
    assert!(part_files(&storage.path().join("backups")).is_empty());

    let dest = work.path().join("restore");
    let downloaded = client.download("backups", "data.bin", &dest).await.unwrap();
    assert_eq!(downloaded.path, dest.join("backups").join("data.bin"));
    assert_eq!(downloaded.bytes, 10_000);
    assert_files_equal(&source, &downloaded.path);

    server.stop().await;
}

#[tokio::test]
async fn test_download_with_different_chunk_size() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;

    let content = random_bytes(5000);
    let source = create_test_file(work.path(), "odd.bin", &content);

    client_for(server.addr, None, 1024)
        .upload("t", source.to_str().unwrap())
        .await
        .unwrap();

    let downloaded = client_for(server.addr, None, 777)
        .download("t", "odd.bin", &work.path().join("out"))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&downloaded.path).unwrap(), content);

    server.stop().await;
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;

    let source = create_test_file(work.path(), "empty.txt", b"");
    let client = client_for(server.addr, None, 1024);

    let outcome = client.upload("t", source.to_str().unwrap()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(
        std::fs::metadata(storage.path().join("t").join("empty.txt"))
            .unwrap()
            .len(),
        0
    );

    let downloaded = client
        .download("t", "empty.txt", &work.path().join("out"))
        .await
        .unwrap();
    assert_eq!(downloaded.bytes, 0);
    assert!(downloaded.path.exists());

    server.stop().await;
}

#[tokio::test]
async fn test_identical_upload_is_rejected() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;

    let source = create_test_file(work.path(), "same.txt", b"unchanged content");
    let client = client_for(server.addr, None, 4);

    let first = client.upload("t", source.to_str().unwrap()).await.unwrap();
    assert!(first.is_completed());

    let second = client.upload("t", source.to_str().unwrap()).await.unwrap();
    assert_eq!(
        second,
        UploadOutcome::Rejected {
            message: "File already exists".to_string()
        }
    );

    server.stop().await;
}

#[tokio::test]
async fn test_changed_content_replaces_object() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;
    let client = client_for(server.addr, None, 8);

    let source = create_test_file(work.path(), "notes.txt", b"first version");
    assert!(client
        .upload("t", source.to_str().unwrap())
        .await
        .unwrap()
        .is_completed());

    std::fs::write(&source, b"second, longer version of the notes").unwrap();
    assert!(client
        .upload("t", source.to_str().unwrap())
        .await
        .unwrap()
        .is_completed());

    let stored = std::fs::read(storage.path().join("t").join("notes.txt")).unwrap();
    assert_eq!(stored, b"second, longer version of the notes");
    assert!(part_files(&storage.path().join("t")).is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_list_reports_stored_objects() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;
    let client = client_for(server.addr, None, 1024);

    let beta = create_test_file(work.path(), "beta.txt", b"bbbb");
    let alpha = create_test_file(work.path(), "alpha.txt", b"aa");
    client.upload("docs", beta.to_str().unwrap()).await.unwrap();
    client.upload("docs", alpha.to_str().unwrap()).await.unwrap();

    let items = client.list("docs").await.unwrap();
    let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["alpha.txt", "beta.txt"]);
    assert_eq!(items[0].size, 2);
    assert_eq!(items[0].hash, hash_bytes(b"aa"));
    assert_eq!(items[1].size, 4);
    assert!(items[1].modified_time > 0);

    server.stop().await;
}

#[tokio::test]
async fn test_list_includes_names_with_part_suffix() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;
    let client = client_for(server.addr, None, 1024);

    let plain = create_test_file(work.path(), "plain.bin", b"plain");
    let notes = create_test_file(work.path(), "notes.qback-part", b"notes");
    for source in [&plain, &notes] {
        assert!(client
            .upload("t", source.to_str().unwrap())
            .await
            .unwrap()
            .is_completed());
    }

    let items = client.list("t").await.unwrap();
    let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["notes.qback-part", "plain.bin"]);

    server.stop().await;
}

#[tokio::test]
async fn test_long_object_name_round_trip() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let restore = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;
    let client = client_for(server.addr, None, 16);

    let name = format!("{}.bin", "x".repeat(236));
    let content = random_bytes(100);
    let source = create_test_file(work.path(), &name, &content);

    let outcome = client.upload("t", source.to_str().unwrap()).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");

    let downloaded = client.download("t", &name, restore.path()).await.unwrap();
    assert_files_equal(&source, &downloaded.path);
    assert!(part_files(&storage.path().join("t")).is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_list_missing_tag() {
    let storage = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;

    let err = client_for(server.addr, None, 1024)
        .list("nothing-here")
        .await
        .unwrap_err();
    match err {
        Error::Remote(message) => {
            assert_eq!(message, "Get file list error: folder not exists");
        }
        other => panic!("unexpected error: {other}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_download_missing_object() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;

    let dest = work.path().join("out");
    let err = client_for(server.addr, None, 1024)
        .download("t", "ghost.bin", &dest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(ref m) if m == "file does not exist"));
    assert!(!dest.join("t").join("ghost.bin").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_download_refuses_existing_target() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;
    let client = client_for(server.addr, None, 1024);

    let source = create_test_file(work.path(), "keep.txt", b"server copy");
    client.upload("t", source.to_str().unwrap()).await.unwrap();

    let dest = work.path().join("out");
    let existing = create_test_file(&dest.join("t"), "keep.txt", b"local copy");

    let err = client.download("t", "keep.txt", &dest).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert_eq!(std::fs::read(&existing).unwrap(), b"local copy");

    server.stop().await;
}

#[tokio::test]
async fn test_memory_mode_benchmark_upload() {
    let server = start_memory_server().await;
    let client = client_for(server.addr, None, 64 * 1024);

    let outcome = client
        .upload("bench", "benchmark://payload/300000")
        .await
        .unwrap();
    match outcome {
        UploadOutcome::Completed { name, bytes, .. } => {
            assert!(name.starts_with("payload_"));
            assert_eq!(bytes, 300_000);
        }
        UploadOutcome::Rejected { message } => panic!("upload rejected: {message}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_memory_mode_accepts_repeated_uploads() {
    let work = create_temp_dir();
    let server = start_memory_server().await;
    let client = client_for(server.addr, None, 1024);

    let source = create_test_file(work.path(), "again.bin", &random_bytes(4096));
    for _ in 0..2 {
        let outcome = client.upload("t", source.to_str().unwrap()).await.unwrap();
        assert!(outcome.is_completed());
    }

    server.stop().await;
}

#[tokio::test]
async fn test_memory_mode_refuses_list_and_download() {
    let work = create_temp_dir();
    let server = start_memory_server().await;
    let client = client_for(server.addr, None, 1024);

    let err = client.list("t").await.unwrap_err();
    assert!(matches!(err, Error::Remote(ref m) if m == "ListFiles not supported in Memory Mode"));

    let err = client
        .download("t", "x.bin", &work.path().join("out"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Remote(ref m) if m == "download not supported in Memory Mode")
    );

    server.stop().await;
}

#[tokio::test]
async fn test_ping() {
    let server = start_memory_server().await;

    let rtt = client_for(server.addr, None, 1024).ping().await.unwrap();
    assert!(rtt < std::time::Duration::from_secs(5));

    server.stop().await;
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let server = start_memory_server().await;
    let addr = server.addr;
    server.stop().await;

    let err = client_for(addr, None, 1024).ping().await.unwrap_err();
    assert!(matches!(err, Error::Connect { .. }), "got {err}");
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_concurrent_uploads() {
    let storage = create_temp_dir();
    let work = create_temp_dir();
    let server = start_directory_server(storage.path(), None).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let content = random_bytes(20_000 + i * 100);
        let path = create_test_file(work.path(), &format!("file{i}.bin"), &content);
        let client = client_for(server.addr, None, 2048);
        handles.push(tokio::spawn(async move {
            client.upload("many", path.to_str().unwrap()).await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_completed());
    }

    for i in 0..4 {
        let name = format!("file{i}.bin");
        assert_files_equal(
            &work.path().join(&name),
            &storage.path().join("many").join(&name),
        );
    }

    server.stop().await;
}
