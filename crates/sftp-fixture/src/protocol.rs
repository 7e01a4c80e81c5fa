//! SFTP protocol subset
//!
//! The wire format follows draft-ietf-secsh-filexfer-02 (protocol version 3),
//! restricted to the operations a file/directory CRUD fixture needs. Requests
//! outside the subset are answered with `SSH_FX_OP_UNSUPPORTED` instead of
//! being dropped, so real clients fail their unsupported calls gracefully.
//!
//! On the wire every packet is framed as `u32 length` followed by `u8 type`
//! and the payload; [`FrameBuffer`] reassembles packets from the SSH channel
//! data stream, which may split or coalesce them arbitrarily.

use bytes::{Buf, BufMut, BytesMut};

/// SFTP protocol version spoken by the fixture
pub const SFTP_VERSION: u32 = 3;

/// Upper bound on a single SFTP packet accepted from a client
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// SFTP message types (as defined in the SFTP specification)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initialize SFTP session
    Init = 1,
    /// Version response
    Version = 2,
    /// Open file
    Open = 3,
    /// Close file or directory handle
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Get file attributes by path (no symlink following)
    Lstat = 7,
    /// Get file attributes by handle
    Fstat = 8,
    /// Set file attributes by path
    Setstat = 9,
    /// Set file attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Get real path
    Realpath = 16,
    /// Get file attributes by path
    Stat = 17,
    /// Rename file or directory (unsupported)
    Rename = 18,
    /// Read symbolic link (unsupported)
    Readlink = 19,
    /// Create symbolic link (unsupported)
    Symlink = 20,
    /// Status response
    Status = 101,
    /// Handle response
    Handle = 102,
    /// Data response
    Data = 103,
    /// Name response (for directory listings)
    Name = 104,
    /// Attributes response
    Attrs = 105,
    /// Extended request (unsupported)
    Extended = 200,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            _ => Err(crate::Error::Protocol(format!(
                "unknown message type: {value}"
            ))),
        }
    }
}

/// SFTP status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// General failure
    Failure = 4,
    /// Bad message
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// File open flags (as defined in the SFTP spec)
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading
    pub const READ: u32 = 0x0000_0001;
    /// Open for writing
    pub const WRITE: u32 = 0x0000_0002;
    /// Writes go to the end of the file
    pub const APPEND: u32 = 0x0000_0004;
    /// Create the file if it does not exist
    pub const CREAT: u32 = 0x0000_0008;
    /// Truncate an existing file
    pub const TRUNC: u32 = 0x0000_0010;
    /// Fail if the file already exists
    pub const EXCL: u32 = 0x0000_0020;

    /// READ flag set?
    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    /// WRITE flag set?
    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// APPEND flag set?
    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// CREAT flag set?
    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    /// TRUNC flag set?
    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// EXCL flag set?
    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// POSIX file-type bits carried in the permissions field; version-3 clients
/// classify directory entries by these.
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;

/// File attributes (as defined in the SFTP spec)
#[derive(Debug, Clone, Default)]
pub struct FileAttrs {
    /// File size in bytes
    pub size: Option<u64>,
    /// Owner id
    pub uid: Option<u32>,
    /// Group id
    pub gid: Option<u32>,
    /// Permissions, including the file-type bits
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch
    pub atime: Option<u32>,
    /// Modification time, seconds since the epoch
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;

    /// Attributes of a regular file of `len` bytes
    pub fn regular(len: u64) -> Self {
        Self {
            size: Some(len),
            permissions: Some(S_IFREG | 0o644),
            ..Self::default()
        }
    }

    /// Attributes of a directory
    pub fn directory() -> Self {
        Self {
            permissions: Some(S_IFDIR | 0o755),
            ..Self::default()
        }
    }

    /// True iff the permissions field marks a directory
    pub fn is_dir(&self) -> bool {
        self.permissions
            .is_some_and(|mode| mode & S_IFDIR != 0)
    }

    /// Encode file attributes to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    /// Decode file attributes from bytes
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol("insufficient data for flags".into()));
        }

        let flags = buf.get_u32();
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::Protocol("insufficient data for size".into()));
            }
            attrs.size = Some(buf.get_u64());
        }

        if flags & Self::FLAG_UIDGID != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::Protocol("insufficient data for uid/gid".into()));
            }
            attrs.uid = Some(buf.get_u32());
            attrs.gid = Some(buf.get_u32());
        }

        if flags & Self::FLAG_PERMISSIONS != 0 {
            if buf.remaining() < 4 {
                return Err(crate::Error::Protocol(
                    "insufficient data for permissions".into(),
                ));
            }
            attrs.permissions = Some(buf.get_u32());
        }

        if flags & Self::FLAG_ACMODTIME != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::Protocol(
                    "insufficient data for atime/mtime".into(),
                ));
            }
            attrs.atime = Some(buf.get_u32());
            attrs.mtime = Some(buf.get_u32());
        }

        Ok(attrs)
    }
}

/// Reassembles length-framed SFTP packets from SSH channel data.
///
/// The channel delivers an arbitrary byte stream: one data event may hold a
/// partial packet or several whole ones. Push everything in, then drain
/// complete packets (type byte + payload, without the length prefix).
#[derive(Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw channel data.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete packet, if one has fully arrived.
    pub fn next_packet(&mut self) -> crate::Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > MAX_PACKET_SIZE {
            return Err(crate::Error::Protocol(format!(
                "invalid packet length: {len}"
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let packet = self.buf.split_to(len);
        Ok(Some(packet.to_vec()))
    }
}

/// Prefix a packet with its length for the wire.
pub fn frame(packet: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + packet.len());
    framed.extend_from_slice(&(packet.len() as u32).to_be_bytes());
    framed.extend_from_slice(packet);
    framed
}

/// Helper functions for encoding/decoding SFTP protocol strings
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    /// Encode a string as SFTP string (length + data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode an SFTP string
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Protocol(format!("invalid UTF-8 string: {e}")))
    }

    /// Encode bytes as SFTP string (length + data)
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode SFTP bytes
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol(
                "insufficient data for length".into(),
            ));
        }

        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(crate::Error::Protocol("insufficient data for body".into()));
        }

        let bytes = &buf[..len];
        buf.advance(len);

        Ok(bytes.to_vec())
    }
}
