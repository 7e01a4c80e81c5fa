//! # SFTP Fixture
//!
//! An in-memory SFTP server for tests.
//!
//! The fixture runs a real SSH/SFTP endpoint (password authentication,
//! protocol version 3) on a local port while your test code is running, and
//! serves a virtual filesystem that lives purely in memory. Code under test
//! talks to it with any SFTP client; the test itself seeds and inspects the
//! filesystem through the [`SftpFixture`] facade.
//!
//! ## Usage
//!
//! Wrap the test body with [`with_sftp_server`]:
//!
//! ```no_run
//! use sftp_fixture::with_sftp_server;
//!
//! # async fn some_test() -> anyhow::Result<()> {
//! with_sftp_server(|server| async move {
//!     server.put_file("/directory/file.bin", [0x01, 0x02, 0x03])?;
//!     let port = server.port().await?;
//!     // run the code under test against 127.0.0.1:{port},
//!     // then verify what it wrote:
//!     let uploaded = server.file_content("/results/out.bin")?;
//!     assert!(!uploaded.is_empty());
//!     Ok(())
//! })
//! .await
//! # }
//! ```
//!
//! The server starts before the closure and is torn down afterwards, on
//! success and on failure alike. Using the facade after the scope ended
//! fails with a state error naming the attempted operation.
//!
//! By default every username/password pair is accepted; restrict it with
//! [`SftpFixture::add_user`]. The port is auto-allocated and readable via
//! [`SftpFixture::port`]; [`SftpFixture::set_port`] moves the server
//! (restarting it) when a fixed port is required.
//!
//! For test styles that cannot live inside one closure, construct the
//! fixture manually:
//!
//! ```no_run
//! use sftp_fixture::SftpFixture;
//!
//! # async fn bdd_style() -> anyhow::Result<()> {
//! let server = SftpFixture::start().await?;
//! server.add_user("me", "xoxox");
//! server.put_file("/a/b/one.txt", "first line\n")?;
//! // ... given/when/then blocks using the server ...
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod error;
pub mod fixture;
pub mod protocol;
pub mod vfs;

mod server;

pub use error::{Error, Result};
pub use fixture::{with_sftp_server, SftpFixture};
