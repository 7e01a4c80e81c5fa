//! SFTP server session manager
//!
//! Binds one listening SSH/SFTP endpoint to one virtual filesystem and one
//! credential store. The listener accepts connections on a tokio task and
//! hands each one to russh; every accepted session speaks the SFTP subsystem
//! against a [`UncloseableFs`] wrapper around the scope's shared store, so a
//! session ending (which closes the filesystem handle it was given) never
//! tears down the filesystem other sessions and the facade still use.

use crate::auth::CredentialStore;
use crate::protocol::{self, codec, FileAttrs, FrameBuffer, MessageType, OpenFlags, StatusCode, SFTP_VERSION};
use crate::vfs::{self, DirEntry, MemoryFs, SessionFs, UncloseableFs};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cap on open handles per session
const MAX_HANDLES: usize = 1024;

/// Directory entries returned per READDIR response
const READDIR_BATCH: usize = 100;

/// A running SFTP listener bound to one port.
///
/// Dropping the handle does not stop the server; call [`Listener::stop`],
/// which cancels the accept loop and forcibly closes every open session.
pub(crate) struct Listener {
    port: u16,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Bind `127.0.0.1:port` (0 = OS-assigned) and start accepting SFTP
    /// sessions backed by `fs` and authenticated against `credentials`.
    ///
    /// The host identity is a freshly generated Ed25519 key, never persisted.
    pub(crate) async fn bind(
        port: u16,
        fs: Arc<MemoryFs>,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self> {
        let host_key = key::KeyPair::generate_ed25519()
            .ok_or_else(|| Error::Ssh("failed to generate an ephemeral host key".into()))?;

        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(0),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        });

        let socket = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = socket.local_addr()?.port();
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            socket,
            config,
            fs,
            credentials,
            shutdown.clone(),
        ));

        info!("SFTP fixture listening on 127.0.0.1:{port}");
        Ok(Self {
            port,
            shutdown,
            accept_task,
        })
    }

    /// The port the listener is bound to.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Stop listening, abort all open sessions and release the port.
    pub(crate) async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.accept_task
            .await
            .map_err(|e| Error::Ssh(format!("listener task failed: {e}")))?;
        Ok(())
    }
}

async fn accept_loop(
    socket: TcpListener,
    config: Arc<russh::server::Config>,
    fs: Arc<MemoryFs>,
    credentials: Arc<CredentialStore>,
    shutdown: CancellationToken,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = socket.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("failed to accept connection: {err}");
                        continue;
                    }
                };
                debug!("accepted connection from {peer_addr}");

                let handler = ClientHandler::new(fs.clone(), credentials.clone());
                let config = config.clone();
                sessions.spawn(async move {
                    match russh::server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            if let Err(err) = session.await {
                                debug!("session ended with error: {err}");
                            }
                        }
                        Err(err) => debug!("SSH handshake failed: {err}"),
                    }
                });
            }
        }
    }

    // the listener is going away, take every live session with it
    sessions.abort_all();
    while sessions.join_next().await.is_some() {}
    debug!("listener stopped, all sessions closed");
}

/// Per-connection SSH handler speaking the SFTP subsystem.
struct ClientHandler {
    credentials: Arc<CredentialStore>,
    session: SftpSession,
    frames: FrameBuffer,
}

impl ClientHandler {
    fn new(fs: Arc<MemoryFs>, credentials: Arc<CredentialStore>) -> Self {
        // Each session gets a non-closing wrapper; the transport closes the
        // filesystem it was handed at session end.
        let session_fs: Arc<dyn SessionFs> =
            Arc::new(UncloseableFs::new(fs as Arc<dyn SessionFs>));
        Self {
            credentials,
            session: SftpSession::new(session_fs),
            frames: FrameBuffer::new(),
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        if self.credentials.authenticate(user, password) {
            info!("password authentication succeeded for user: {user}");
            Ok(Auth::Accept)
        } else {
            warn!("password authentication failed for user: {user}");
            Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PASSWORD),
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!("channel opened for session");
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        debug!("subsystem request: {name}");

        if name == "sftp" {
            session.channel_success(channel_id);
            Ok(())
        } else {
            warn!("unsupported subsystem: {name}");
            session.channel_failure(channel_id);
            Err(Error::Protocol(format!("unsupported subsystem: {name}")))
        }
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<()> {
        self.frames.push(data);

        while let Some(packet) = self.frames.next_packet()? {
            let response = self.session.handle_packet(&packet).await?;
            if response.is_empty() {
                continue;
            }
            let framed = protocol::frame(&response);
            session.data(channel, CryptoVec::from_slice(&framed));
        }

        Ok(())
    }
}

/// Open handle state; handles are stateless references into the shared
/// filesystem, reads and writes always go through the store.
enum SessionHandle {
    File { path: String, append: bool },
    Dir {
        path: String,
        entries: Vec<DirEntry>,
        index: usize,
    },
}

/// SFTP session state: dispatches decoded packets against the filesystem
/// handle the session was given.
pub(crate) struct SftpSession {
    fs: Arc<dyn SessionFs>,
    handles: HashMap<Vec<u8>, SessionHandle>,
    next_handle_id: u32,
    initialized: bool,
}

impl SftpSession {
    pub(crate) fn new(fs: Arc<dyn SessionFs>) -> Self {
        Self {
            fs,
            handles: HashMap::new(),
            next_handle_id: 0,
            initialized: false,
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        let handle_count = self.handles.len();
        if handle_count > 0 {
            debug!("dropping {handle_count} open handles on session end");
            self.handles.clear();
        }
        // Transport teardown closes the filesystem handle it was given.
        if let Err(err) = self.fs.close() {
            debug!("closing session filesystem failed: {err}");
        }
    }
}

impl SftpSession {
    /// Handle one unframed SFTP packet (type byte + payload) and produce the
    /// unframed response packet. Filesystem failures become STATUS responses;
    /// only protocol violations abort the session.
    pub(crate) async fn handle_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.is_empty() {
            return Err(Error::Protocol("empty packet".into()));
        }

        let msg_type = MessageType::try_from(packet[0])?;
        let mut buf = &packet[1..];

        debug!("received SFTP message: {msg_type:?}");

        if !self.initialized && msg_type != MessageType::Init {
            return Err(Error::Protocol(format!(
                "received {msg_type:?} before initialization"
            )));
        }

        match msg_type {
            MessageType::Init => self.handle_init(&mut buf),
            MessageType::Open => self.handle_open(&mut buf),
            MessageType::Close => self.handle_close(&mut buf),
            MessageType::Read => self.handle_read(&mut buf),
            MessageType::Write => self.handle_write(&mut buf),
            MessageType::Stat | MessageType::Lstat => self.handle_stat(&mut buf),
            MessageType::Fstat => self.handle_fstat(&mut buf),
            MessageType::Setstat => self.handle_setstat(&mut buf),
            MessageType::Fsetstat => self.handle_fsetstat(&mut buf),
            MessageType::Opendir => self.handle_opendir(&mut buf),
            MessageType::Readdir => self.handle_readdir(&mut buf),
            MessageType::Remove => self.handle_remove(&mut buf),
            MessageType::Mkdir => self.handle_mkdir(&mut buf),
            MessageType::Rmdir => self.handle_rmdir(&mut buf),
            MessageType::Realpath => self.handle_realpath(&mut buf),
            MessageType::Rename
            | MessageType::Readlink
            | MessageType::Symlink
            | MessageType::Extended => self.handle_unsupported(&mut buf, msg_type),
            MessageType::Version
            | MessageType::Status
            | MessageType::Handle
            | MessageType::Data
            | MessageType::Name
            | MessageType::Attrs => Err(Error::Protocol(format!(
                "unexpected response-type message from client: {msg_type:?}"
            ))),
        }
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let version = read_u32(buf)?;
        info!("SFTP init, client version: {version}");
        self.initialized = true;

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Version as u8);
        response.put_u32(SFTP_VERSION);

        Ok(response.to_vec())
    }

    fn handle_open(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let filename = codec::get_string(buf)?;
        let pflags = read_u32(buf)?;
        let _attrs = FileAttrs::decode(buf)?;

        let flags = OpenFlags(pflags);
        let path = vfs::canonical(&filename);
        debug!("opening {path} with flags {flags:?}");

        if self.handles.len() >= MAX_HANDLES {
            warn!("maximum open handles reached ({MAX_HANDLES})");
            return self.send_status(request_id, StatusCode::Failure, "too many open handles");
        }

        let existing = match self.fs.metadata(&path) {
            Ok(meta) => Some(meta),
            Err(Error::NotFound(_)) => None,
            Err(err) => return self.send_status_error(request_id, &err),
        };

        match existing {
            Some(meta) if meta.is_dir() => {
                return self.send_status_error(request_id, &Error::IsADirectory(path));
            }
            Some(_) => {
                if flags.has_excl() {
                    return self.send_status_error(request_id, &Error::AlreadyExists(path));
                }
                if flags.has_write() && flags.has_trunc() {
                    if let Err(err) = self.fs.write_file(&path, &[]) {
                        return self.send_status_error(request_id, &err);
                    }
                }
            }
            None => {
                if flags.has_creat() {
                    if let Err(err) = self.fs.write_file(&path, &[]) {
                        return self.send_status_error(request_id, &err);
                    }
                } else {
                    return self.send_status_error(request_id, &Error::NotFound(path));
                }
            }
        }

        let handle_id = self.allocate_handle(SessionHandle::File {
            path,
            append: flags.has_append(),
        });
        self.send_handle(request_id, &handle_id)
    }

    fn handle_close(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        if self.handles.remove(&handle).is_none() {
            warn!("attempt to close an unknown handle");
            return self.send_status_error(
                request_id,
                &Error::invalid_handle("handle does not exist"),
            );
        }

        self.send_status(request_id, StatusCode::Ok, "success")
    }

    fn handle_read(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let offset = read_u64(buf)?;
        let len = read_u32(buf)?;

        debug!("read request: offset={offset}, len={len}");

        let path = match self.handles.get(&handle) {
            Some(SessionHandle::File { path, .. }) => path.clone(),
            Some(SessionHandle::Dir { .. }) => {
                return self.send_status_error(
                    request_id,
                    &Error::invalid_handle("cannot read from a directory handle"),
                );
            }
            None => {
                return self.send_status_error(
                    request_id,
                    &Error::invalid_handle("handle does not exist or is closed"),
                );
            }
        };

        match self.fs.read_at(&path, offset, len) {
            Ok(data) if data.is_empty() => {
                self.send_status(request_id, StatusCode::Eof, "end of file")
            }
            Ok(data) => self.send_data(request_id, &data),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_write(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let offset = read_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        debug!("write request: offset={offset}, len={}", data.len());

        let (path, append) = match self.handles.get(&handle) {
            Some(SessionHandle::File { path, append }) => (path.clone(), *append),
            Some(SessionHandle::Dir { .. }) => {
                return self.send_status_error(
                    request_id,
                    &Error::invalid_handle("cannot write to a directory handle"),
                );
            }
            None => {
                return self.send_status_error(
                    request_id,
                    &Error::invalid_handle("handle does not exist or is closed"),
                );
            }
        };

        let offset = if append {
            match self.fs.metadata(&path) {
                Ok(meta) => meta.len,
                Err(err) => return self.send_status_error(request_id, &err),
            }
        } else {
            offset
        };

        match self.fs.write_at(&path, offset, &data) {
            Ok(()) => self.send_status(request_id, StatusCode::Ok, "success"),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_stat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let path = vfs::canonical(&codec::get_string(buf)?);

        debug!("stat request for {path}");

        match self.fs.metadata(&path) {
            Ok(meta) => self.send_attrs(request_id, attrs_for(meta)),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_fstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        let path = match self.handles.get(&handle) {
            Some(SessionHandle::File { path, .. }) | Some(SessionHandle::Dir { path, .. }) => {
                path.clone()
            }
            None => {
                return self.send_status_error(
                    request_id,
                    &Error::invalid_handle("handle does not exist or is closed"),
                );
            }
        };

        match self.fs.metadata(&path) {
            Ok(meta) => self.send_attrs(request_id, attrs_for(meta)),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    // The memory store has no attribute views; attribute changes are
    // acknowledged without effect so client upload flows complete.
    fn handle_setstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let path = vfs::canonical(&codec::get_string(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        debug!("setstat request for {path} (attributes ignored)");

        match self.fs.metadata(&path) {
            Ok(_) => self.send_status(request_id, StatusCode::Ok, "success"),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_fsetstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let _attrs = FileAttrs::decode(buf)?;

        if self.handles.contains_key(&handle) {
            debug!("fsetstat request (attributes ignored)");
            self.send_status(request_id, StatusCode::Ok, "success")
        } else {
            self.send_status_error(
                request_id,
                &Error::invalid_handle("handle does not exist or is closed"),
            )
        }
    }

    fn handle_opendir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let path = vfs::canonical(&codec::get_string(buf)?);

        debug!("opening directory {path}");

        if self.handles.len() >= MAX_HANDLES {
            warn!("maximum open handles reached ({MAX_HANDLES})");
            return self.send_status(request_id, StatusCode::Failure, "too many open handles");
        }

        match self.fs.read_dir(&path) {
            Ok(entries) => {
                let handle_id = self.allocate_handle(SessionHandle::Dir {
                    path,
                    entries,
                    index: 0,
                });
                self.send_handle(request_id, &handle_id)
            }
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_readdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        let batch = match self.handles.get_mut(&handle) {
            Some(SessionHandle::Dir { entries, index, .. }) => {
                if *index >= entries.len() {
                    None
                } else {
                    let end = (*index + READDIR_BATCH).min(entries.len());
                    let batch = entries[*index..end].to_vec();
                    *index = end;
                    Some(batch)
                }
            }
            Some(SessionHandle::File { .. }) => {
                return self.send_status_error(
                    request_id,
                    &Error::invalid_handle("cannot read entries from a file handle"),
                );
            }
            None => {
                return self.send_status_error(
                    request_id,
                    &Error::invalid_handle("handle does not exist or is closed"),
                );
            }
        };

        let Some(batch) = batch else {
            return self.send_status(request_id, StatusCode::Eof, "end of directory");
        };

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Name as u8);
        response.put_u32(request_id);
        response.put_u32(batch.len() as u32);

        for entry in &batch {
            let attrs = attrs_for(entry.metadata);
            codec::put_string(&mut response, &entry.name);
            codec::put_string(&mut response, &longname(entry));
            response.put(attrs.encode());
        }

        Ok(response.to_vec())
    }

    fn handle_remove(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let path = vfs::canonical(&codec::get_string(buf)?);

        debug!("removing file {path}");

        match self.fs.remove_file(&path) {
            Ok(()) => self.send_status(request_id, StatusCode::Ok, "success"),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_mkdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let path = vfs::canonical(&codec::get_string(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        debug!("creating directory {path}");

        match self.fs.create_dir(&path) {
            Ok(()) => self.send_status(request_id, StatusCode::Ok, "success"),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_rmdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let path = vfs::canonical(&codec::get_string(buf)?);

        debug!("removing directory {path}");

        match self.fs.remove_dir(&path) {
            Ok(()) => self.send_status(request_id, StatusCode::Ok, "success"),
            Err(err) => self.send_status_error(request_id, &err),
        }
    }

    fn handle_realpath(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        let path = codec::get_string(buf)?;
        let resolved = vfs::canonical(&path);

        debug!("realpath: {path} -> {resolved}");

        let attrs = match self.fs.metadata(&resolved) {
            Ok(meta) => attrs_for(meta),
            Err(_) => FileAttrs::default(),
        };

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Name as u8);
        response.put_u32(request_id);
        response.put_u32(1);
        codec::put_string(&mut response, &resolved);
        codec::put_string(&mut response, &resolved);
        response.put(attrs.encode());

        Ok(response.to_vec())
    }

    fn handle_unsupported(&mut self, buf: &mut &[u8], msg_type: MessageType) -> Result<Vec<u8>> {
        let request_id = read_u32(buf)?;
        warn!("unsupported message type: {msg_type:?}");
        self.send_status(
            request_id,
            StatusCode::OpUnsupported,
            "operation not supported",
        )
    }

    // Response builders

    fn allocate_handle(&mut self, handle: SessionHandle) -> Vec<u8> {
        let id = self.next_handle_id;
        self.next_handle_id += 1;

        let handle_id = id.to_be_bytes().to_vec();
        self.handles.insert(handle_id.clone(), handle);
        handle_id
    }

    fn send_status(&self, request_id: u32, code: StatusCode, msg: &str) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Status as u8);
        response.put_u32(request_id);
        response.put_u32(code.into());
        codec::put_string(&mut response, msg);
        codec::put_string(&mut response, "en");

        Ok(response.to_vec())
    }

    fn send_status_error(&self, request_id: u32, error: &Error) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Status as u8);
        response.put_u32(request_id);
        response.put_u32(error.to_status_code());
        codec::put_string(&mut response, &error.to_string());
        codec::put_string(&mut response, "en");

        Ok(response.to_vec())
    }

    fn send_handle(&self, request_id: u32, handle: &[u8]) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Handle as u8);
        response.put_u32(request_id);
        codec::put_bytes(&mut response, handle);

        Ok(response.to_vec())
    }

    fn send_data(&self, request_id: u32, data: &[u8]) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Data as u8);
        response.put_u32(request_id);
        codec::put_bytes(&mut response, data);

        Ok(response.to_vec())
    }

    fn send_attrs(&self, request_id: u32, attrs: FileAttrs) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Attrs as u8);
        response.put_u32(request_id);
        response.put(attrs.encode());

        Ok(response.to_vec())
    }
}

fn attrs_for(meta: crate::vfs::Metadata) -> FileAttrs {
    if meta.is_dir() {
        FileAttrs::directory()
    } else {
        FileAttrs::regular(meta.len)
    }
}

fn longname(entry: &DirEntry) -> String {
    let type_char = if entry.metadata.is_dir() { 'd' } else { '-' };
    format!(
        "{type_char}rw-r--r--    1 sftp     sftp     {:>8} Jan  1  1970 {}",
        entry.metadata.len, entry.name
    )
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(Error::Protocol("insufficient data for u32".into()));
    }
    let value = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(value)
}

fn read_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.len() < 8 {
        return Err(Error::Protocol("insufficient data for u64".into()));
    }
    let value = u64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ]);
    *buf = &buf[8..];
    Ok(value)
}
