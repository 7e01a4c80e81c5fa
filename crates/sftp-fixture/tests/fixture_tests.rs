//! Integration tests for the SFTP fixture facade
//!
//! These exercise the managed scope, the lifecycle guard and the
//! file/directory convenience operations through the public API, plus the
//! TCP-level behavior of the listener.

use encoding_rs::{UTF_8, WINDOWS_1252};
use sftp_fixture::{with_sftp_server, Error, SftpFixture};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Find a currently free port by binding and dropping an ephemeral listener.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_put_file_then_file_content_roundtrip() {
    with_sftp_server(|server| async move {
        let content: Vec<u8> = (0..=255).collect();
        server.put_file("/directory/file.bin", &content)?;
        assert_eq!(server.file_content("/directory/file.bin")?, content);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_put_file_overwrites_existing_file() {
    with_sftp_server(|server| async move {
        server.put_file("/file.txt", "first")?;
        server.put_file("/file.txt", "second")?;
        assert_eq!(server.file_content("/file.txt")?, b"second");
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_text_roundtrip_with_encodings() {
    with_sftp_server(|server| async move {
        let text = "Hëllo wörld — äöü ß €";

        server.put_file_str("/utf8.txt", text, UTF_8)?;
        assert_eq!(server.file_content_str("/utf8.txt", UTF_8)?, text);

        server.put_file_str("/cp1252.txt", text, WINDOWS_1252)?;
        assert_eq!(server.file_content_str("/cp1252.txt", WINDOWS_1252)?, text);

        // the two encodings really produced different bytes
        assert_ne!(
            server.file_content("/utf8.txt")?,
            server.file_content("/cp1252.txt")?
        );
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_put_file_from_reader() {
    with_sftp_server(|server| async move {
        let mut reader = Cursor::new(b"streamed content".to_vec());
        server.put_file_from("/stream/data.bin", &mut reader)?;
        assert_eq!(server.file_content("/stream/data.bin")?, b"streamed content");
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_put_file_creates_missing_ancestors() {
    with_sftp_server(|server| async move {
        server.put_file("/a/b/c/file.txt", "deep")?;
        let root = server.list_files_and_directories("/")?;
        assert!(root.contains(&"/a".to_string()));
        assert_eq!(server.list_files_and_directories("/a/b")?, vec!["/a/b/c"]);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_put_file_onto_directory_fails() {
    with_sftp_server(|server| async move {
        server.create_directory("/dir")?;
        let err = server.put_file("/dir", "x").unwrap_err();
        assert!(matches!(err, Error::IsADirectory(_)), "got {err:?}");
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_exists_file_transitions() {
    with_sftp_server(|server| async move {
        assert!(!server.exists_file("/file.txt")?);
        server.put_file("/file.txt", "content")?;
        assert!(server.exists_file("/file.txt")?);

        // a directory at the path does not count as a file
        server.create_directory("/dir")?;
        assert!(!server.exists_file("/dir")?);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_file_content_of_missing_file_is_not_found() {
    with_sftp_server(|server| async move {
        let err = server.file_content("/no/such/file").unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_list_files_and_directories_of_missing_path_is_not_found() {
    with_sftp_server(|server| async move {
        let err = server.list_files_and_directories("/missing").unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_create_directories_creates_all() {
    with_sftp_server(|server| async move {
        server.create_directories(["/a/directory", "/b/directory"])?;
        let root = server.list_files_and_directories("/")?;
        assert!(root.contains(&"/a".to_string()));
        assert!(root.contains(&"/b".to_string()));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_delete_all_leaves_empty_root() {
    with_sftp_server(|server| async move {
        server.put_file("/top.txt", "x")?;
        server.put_file("/deep/nested/file.bin", [1, 2, 3])?;
        server.create_directory("/empty/dir")?;

        server.delete_all_files_and_directories()?;

        assert!(server.list_files_and_directories("/")?.is_empty());
        assert!(!server.exists_file("/top.txt")?);
        assert!(!server.exists_file("/deep/nested/file.bin")?);

        // the root survived and is writable again
        server.put_file("/again.txt", "y")?;
        assert!(server.exists_file("/again.txt")?);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_set_port_zero_is_an_argument_error() {
    with_sftp_server(|server| async move {
        let before = server.port().await?;
        let err = server.set_port(0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPort { port: 0 }), "got {err:?}");
        let msg = err.to_string();
        assert!(msg.contains("between 1 and 65535"), "got {msg}");

        // no restart happened
        assert_eq!(server.port().await?, before);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_set_port_restarts_on_requested_port() {
    init_logging();
    with_sftp_server(|server| async move {
        let port = free_port();
        server.set_port(port).await?;
        assert_eq!(server.port().await?, port);

        // the restarted listener actually accepts connections
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        drop(stream);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_server_speaks_ssh_on_its_port() {
    init_logging();
    with_sftp_server(|server| async move {
        let port = server.port().await?;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

        let mut banner = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut banner)).await??;
        assert_eq!(&banner[..4], b"SSH-", "unexpected banner: {banner:?}");
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_port_is_released_when_scope_ends() {
    let captured_port = Arc::new(Mutex::new(0u16));
    let slot = captured_port.clone();

    with_sftp_server(move |server| async move {
        *slot.lock().unwrap() = server.port().await?;
        Ok(())
    })
    .await
    .unwrap();

    let port = *captured_port.lock().unwrap();
    assert_ne!(port, 0);
    let connect = TcpStream::connect(("127.0.0.1", port)).await;
    assert!(connect.is_err(), "connected to a stopped server");
}

#[tokio::test]
async fn test_sequential_scopes_use_different_ports() {
    let mut ports = Vec::new();
    for _ in 0..2 {
        let captured = Arc::new(Mutex::new(0u16));
        let slot = captured.clone();
        with_sftp_server(move |server| async move {
            *slot.lock().unwrap() = server.port().await?;
            Ok(())
        })
        .await
        .unwrap();
        ports.push(*captured.lock().unwrap());
    }
    assert_ne!(ports[0], ports[1]);
}

#[tokio::test]
async fn test_callback_error_propagates_and_teardown_still_runs() {
    let captured_port = Arc::new(Mutex::new(0u16));
    let slot = captured_port.clone();

    let result = with_sftp_server(move |server| async move {
        *slot.lock().unwrap() = server.port().await?;
        anyhow::bail!("test code failed")
    })
    .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("test code failed"));

    // the listener was released despite the failure
    let port = *captured_port.lock().unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

fn assert_finished(err: Error, action: &str) {
    match &err {
        Error::Finished { action: named } => assert_eq!(*named, action),
        other => panic!("expected a state error for {action:?}, got {other:?}"),
    }
    assert!(err.to_string().contains(action));
}

#[tokio::test]
async fn test_stale_facade_fails_with_state_errors_naming_the_action() {
    let captured: Arc<Mutex<Option<SftpFixture>>> = Arc::new(Mutex::new(None));
    let slot = captured.clone();

    with_sftp_server(move |server| async move {
        slot.lock().unwrap().replace(server);
        Ok(())
    })
    .await
    .unwrap();

    let stale = captured.lock().unwrap().take().unwrap();

    assert_finished(stale.put_file("/f", "x").unwrap_err(), "upload file");
    assert_finished(
        stale
            .put_file_from("/f", &mut Cursor::new(Vec::new()))
            .unwrap_err(),
        "upload file",
    );
    assert_finished(stale.port().await.unwrap_err(), "call port()");
    assert_finished(stale.set_port(1234).await.unwrap_err(), "set port");
    assert_finished(
        stale.exists_file("/f").unwrap_err(),
        "check existence of file",
    );
    assert_finished(
        stale.create_directory("/d").unwrap_err(),
        "create directory",
    );
    assert_finished(
        stale.list_files_and_directories("/").unwrap_err(),
        "list files",
    );
    assert_finished(stale.file_content("/f").unwrap_err(), "download file");
    assert_finished(
        stale.delete_all_files_and_directories().unwrap_err(),
        "delete all files and directories",
    );
}

#[tokio::test]
async fn test_manual_fixture_start_and_close() {
    let server = SftpFixture::start().await.unwrap();
    let port = server.port().await.unwrap();

    server.put_file("/manual.txt", "manual scope").unwrap();
    assert_eq!(
        server.file_content("/manual.txt").unwrap(),
        b"manual scope"
    );

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    drop(stream);

    server.close().await.unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_scopes_do_not_share_filesystems() {
    with_sftp_server(|server| async move {
        server.put_file("/first-scope.txt", "x")?;
        Ok(())
    })
    .await
    .unwrap();

    with_sftp_server(|server| async move {
        assert!(!server.exists_file("/first-scope.txt")?);
        Ok(())
    })
    .await
    .unwrap();
}
