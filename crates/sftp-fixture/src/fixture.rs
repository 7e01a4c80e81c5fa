//! The server facade and its managed scope
//!
//! [`with_sftp_server`] is the main entry point: it starts an in-memory SFTP
//! server, hands a [`SftpFixture`] to the test code and guarantees teardown
//! whether the test code returns or fails. Test authors commonly stash the
//! fixture in a variable for later assertions by mistake; the lifecycle guard
//! makes every such stale call fail with a state error naming the attempted
//! action instead of silently talking to a dead server.

use crate::auth::CredentialStore;
use crate::server::Listener;
use crate::vfs::{self, MemoryFs, NodeKind, SessionFs};
use crate::{Error, Result};
use encoding_rs::Encoding;
use std::future::Future;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Runs an in-memory SFTP server while the supplied test code is running.
///
/// The server starts on an auto-allocated port before `test_code` runs and
/// is shut down afterwards, on success as well as on error. The filesystem
/// behind it lives purely in memory and is discarded with the scope.
///
/// ```no_run
/// use sftp_fixture::with_sftp_server;
///
/// # async fn example() -> anyhow::Result<()> {
/// with_sftp_server(|server| async move {
///     server.add_user("username", "password");
///     server.put_file("/directory/file.txt", "content of file")?;
///     // connect a real SFTP client to 127.0.0.1 on server.port().await?
///     Ok(())
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
///
/// A teardown failure is never lost: it is returned when the test code
/// succeeded, and attached as context when the test code itself failed.
pub async fn with_sftp_server<F, Fut>(test_code: F) -> anyhow::Result<()>
where
    F: FnOnce(SftpFixture) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let server = SftpFixture::start_on(0).await?;
    let outcome = test_code(server.clone()).await;

    // The scope is over; from here on every facade call is a programmer
    // error, whatever the outcome of the test code was.
    server.shared.finished.store(true, Ordering::SeqCst);

    match (outcome, server.shutdown().await) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(teardown_err)) => Err(teardown_err.into()),
        (Err(test_err), Ok(())) => Err(test_err),
        (Err(test_err), Err(teardown_err)) => {
            Err(test_err.context(format!("scope teardown also failed: {teardown_err}")))
        }
    }
}

struct Shared {
    fs: Arc<MemoryFs>,
    credentials: Arc<CredentialStore>,
    finished: AtomicBool,
    /// The running listener; `None` after a failed restart until a retry
    /// succeeds, and after teardown.
    listener: Mutex<Option<Listener>>,
}

/// Handle to the running fixture: port control, user registration and
/// convenience access to the virtual filesystem the server serves.
///
/// Cloning is cheap and shares the same underlying scope. Inside
/// [`with_sftp_server`] all clones become unusable when the scope ends.
///
/// For test styles where a single closure is impractical (given/when/then
/// blocks, fixtures owned by a harness), construct one manually with
/// [`SftpFixture::start`] and release it with [`SftpFixture::close`].
#[derive(Clone)]
pub struct SftpFixture {
    shared: Arc<Shared>,
}

impl SftpFixture {
    /// Start a fixture on an auto-allocated port, outside any managed scope.
    ///
    /// The caller owns the teardown: call [`close`](Self::close) when done.
    pub async fn start() -> Result<Self> {
        Self::start_on(0).await
    }

    async fn start_on(port: u16) -> Result<Self> {
        let fs = Arc::new(MemoryFs::new());
        let credentials = Arc::new(CredentialStore::new());
        let listener = Listener::bind(port, fs.clone(), credentials.clone()).await?;

        Ok(Self {
            shared: Arc::new(Shared {
                fs,
                credentials,
                finished: AtomicBool::new(false),
                listener: Mutex::new(Some(listener)),
            }),
        })
    }

    /// Stop the server and release the filesystem.
    ///
    /// Equivalent to the teardown [`with_sftp_server`] performs at scope
    /// exit. Remaining clones fail their filesystem operations afterwards
    /// because the store is closed.
    pub async fn close(self) -> Result<()> {
        self.shutdown().await
    }

    async fn shutdown(&self) -> Result<()> {
        debug!("tearing down SFTP fixture");
        let listener = self.shared.listener.lock().await.take();
        let stopped = match listener {
            Some(listener) => listener.stop().await,
            None => Ok(()),
        };
        let closed = self.shared.fs.close();
        stopped.and(closed)
    }

    fn ensure_not_finished(&self, action: &'static str) -> Result<()> {
        if self.shared.finished.load(Ordering::SeqCst) {
            return Err(Error::Finished { action });
        }
        Ok(())
    }

    /// The port the SFTP server is listening on.
    pub async fn port(&self) -> Result<u16> {
        self.ensure_not_finished("call port()")?;
        let listener = self.shared.listener.lock().await;
        listener.as_ref().map(Listener::port).ok_or(Error::NotRunning)
    }

    /// Move the SFTP server to `port`. The server is restarted.
    ///
    /// Fails with an argument error for port 0 (the only representable value
    /// outside 1..=65535) before any restart is attempted. If stopping or
    /// starting fails the listener is gone and server operations keep
    /// failing until a `set_port` retry succeeds.
    pub async fn set_port(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidPort { port });
        }
        self.ensure_not_finished("set port")?;

        let mut slot = self.shared.listener.lock().await;
        if let Some(listener) = slot.take() {
            listener.stop().await.map_err(Error::restart)?;
        }
        let listener = Listener::bind(
            port,
            self.shared.fs.clone(),
            self.shared.credentials.clone(),
        )
        .await
        .map_err(Error::restart)?;
        *slot = Some(listener);
        Ok(())
    }

    /// Register a username/password pair.
    ///
    /// Until the first registration the server accepts every pair;
    /// afterwards only registered pairs are accepted. Registering the same
    /// username again replaces its password. Takes effect immediately, no
    /// restart needed.
    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) -> &Self {
        self.shared.credentials.add_user(username, password);
        self
    }

    /// Put a file onto the server, creating missing parent directories.
    /// An existing file at `path` is overwritten.
    pub fn put_file(&self, path: &str, content: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_not_finished("upload file")?;
        self.ensure_parent_exists(path)?;
        self.shared.fs.write_file(path, content.as_ref())
    }

    /// Put a text file onto the server, encoded with `encoding`.
    pub fn put_file_str(
        &self,
        path: &str,
        content: &str,
        encoding: &'static Encoding,
    ) -> Result<()> {
        let (bytes, _, _) = encoding.encode(content);
        self.put_file(path, bytes.as_ref())
    }

    /// Put a file onto the server, reading its content from `reader` until
    /// exhaustion. The read happens synchronously on the calling thread and
    /// may block.
    pub fn put_file_from(&self, path: &str, reader: &mut dyn Read) -> Result<()> {
        self.ensure_not_finished("upload file")?;
        self.ensure_parent_exists(path)?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        self.shared.fs.write_file(path, &content)
    }

    /// Create a directory, including missing ancestors. Existing directories
    /// are fine.
    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.ensure_not_finished("create directory")?;
        self.shared.fs.create_dir_all(path)
    }

    /// Create multiple directories in order. The first failure aborts the
    /// remaining ones.
    pub fn create_directories<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        for path in paths {
            self.create_directory(path.as_ref())?;
        }
        Ok(())
    }

    /// Get a file's content from the server.
    ///
    /// Fails with a not-found error ([`Error::is_not_found`]) if no file
    /// exists at `path`.
    pub fn file_content(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_not_finished("download file")?;
        self.shared.fs.read_file(path)
    }

    /// Get a text file's content from the server, decoded with `encoding`.
    /// Malformed sequences decode to replacement characters.
    pub fn file_content_str(&self, path: &str, encoding: &'static Encoding) -> Result<String> {
        let bytes = self.file_content(path)?;
        let (text, _, _) = encoding.decode(&bytes);
        Ok(text.into_owned())
    }

    /// Check whether a regular file exists at `path`.
    ///
    /// Returns `false` when nothing exists there, and also when a directory
    /// does.
    pub fn exists_file(&self, path: &str) -> Result<bool> {
        self.ensure_not_finished("check existence of file")?;
        match self.shared.fs.metadata(path) {
            Ok(meta) => Ok(meta.kind == NodeKind::File),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// List the immediate children of the directory at `path`, as absolute
    /// paths. The result is a point-in-time snapshot, not a live view.
    ///
    /// Fails with a not-found error if `path` does not exist.
    pub fn list_files_and_directories(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_not_finished("list files")?;
        let entries = self.shared.fs.read_dir(path)?;
        Ok(entries
            .into_iter()
            .map(|entry| vfs::join(path, &entry.name))
            .collect())
    }

    /// Delete every file and directory on the server, leaving the empty
    /// root behind.
    ///
    /// Traversal is depth-first: files are removed on visit, directories
    /// after their children.
    pub fn delete_all_files_and_directories(&self) -> Result<()> {
        self.ensure_not_finished("delete all files and directories")?;
        self.remove_tree("/", true)
    }

    fn remove_tree(&self, path: &str, is_root: bool) -> Result<()> {
        for entry in self.shared.fs.read_dir(path)? {
            let child = vfs::join(path, &entry.name);
            match entry.metadata.kind {
                NodeKind::Directory => self.remove_tree(&child, false)?,
                NodeKind::File => self.shared.fs.remove_file(&child)?,
            }
        }
        if !is_root {
            self.shared.fs.remove_dir(path)?;
        }
        Ok(())
    }

    /// Ancestor directories of an upload target are created on demand; when
    /// the parent is the filesystem root there is nothing to create.
    fn ensure_parent_exists(&self, path: &str) -> Result<()> {
        if let Some(parent) = vfs::parent(path) {
            self.shared.fs.create_dir_all(&parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_user_chains_and_last_write_wins() {
        let server = SftpFixture::start().await.unwrap();
        server
            .add_user("user", "first")
            .add_user("user", "second")
            .add_user("other", "pass");

        assert!(!server.shared.credentials.authenticate("user", "first"));
        assert!(server.shared.credentials.authenticate("user", "second"));
        assert!(server.shared.credentials.authenticate("other", "pass"));

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_close_poisons_remaining_clones() {
        let server = SftpFixture::start().await.unwrap();
        let clone = server.clone();
        server.close().await.unwrap();

        // no guard flip in manual mode; the closed store is what fails
        let err = clone.put_file("/f", b"x").unwrap_err();
        assert!(matches!(err, Error::FilesystemClosed), "got {err:?}");
        let err = clone.port().await.unwrap_err();
        assert!(matches!(err, Error::NotRunning), "got {err:?}");
    }

    #[tokio::test]
    async fn test_parent_of_root_child_is_not_created() {
        let server = SftpFixture::start().await.unwrap();

        // a file directly under the root needs no ancestor handling
        server.put_file("/top.txt", b"x").unwrap();
        assert!(server.exists_file("/top.txt").unwrap());

        server.close().await.unwrap();
    }
}
