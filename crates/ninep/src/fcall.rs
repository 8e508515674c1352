//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000/9P2000.u

use std::fs;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.u version string
pub const P92000U: &str = "9P2000.u";

/*
 * 9P magic numbers
 */
/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that
/// authentication is not required, the afid field in the attach message should
/// be set to `NOFID`
pub const NOFID: u32 = !0;

/// Special uid which `Tauth`/`Tattach` use as `n_uname` to indicate no
/// numeric user id is specified
pub const NOUID: u32 = !0;

/// Ample room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Maximum number of path elements in a single `Twalk`
pub const MAXWELEM: usize = 16;

/// v9fs default port
pub const V9FS_PORT: u16 = 564;

/// Message size clients propose by default
pub const DEFAULT_MSIZE: u32 = 8192 + IOHDRSZ;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 32;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for symbolic links (9P2000.u)
    pub const SYMLINK: u32 = 0x02000000;
    /// Mode bit for hard links (9P2000.u)
    pub const LINK: u32 = 0x01000000;
    /// Mode bit for device files (9P2000.u)
    pub const DEVICE: u32 = 0x00800000;
    /// Mode bit for named pipes (9P2000.u)
    pub const NAMEDPIPE: u32 = 0x00200000;
    /// Mode bit for sockets (9P2000.u)
    pub const SOCKET: u32 = 0x00100000;
    /// Mode bit for setuid (9P2000.u)
    pub const SETUID: u32 = 0x00080000;
    /// Mode bit for setgid (9P2000.u)
    pub const SETGID: u32 = 0x00040000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in Qid.typ
    ///
    /// QidType can be constructed from std::fs::FileType via From trait
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bit for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bit for hard links (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<fs::FileType> for QidType {
    fn from(typ: fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a fs::FileType> for QidType {
    fn from(typ: &'a fs::FileType) -> Self {
        let mut qid_type = QidType::FILE;

        if typ.is_dir() {
            qid_type.insert(QidType::DIR)
        }

        if typ.is_symlink() {
            qid_type.insert(QidType::SYMLINK)
        }

        qid_type
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; typically, it is incremented every time
    /// the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    /// Wire size of a qid: type[1] version[4] path[8]
    pub const SIZE: u32 = 13;
}

/// Plan 9 namespace metadata (somewhat like a unix fstat)
///
/// The four trailing fields are only carried on the wire when the
/// 9P2000.u dialect was negotiated.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
    /// Special file contents, e.g. symlink target (9P2000.u)
    pub ext: String,
    /// Numeric owner id (9P2000.u)
    pub n_uid: u32,
    /// Numeric group id (9P2000.u)
    pub n_gid: u32,
    /// Numeric last-modifier id (9P2000.u)
    pub n_muid: u32,
}

impl Stat {
    /// Wire size of the stat record, excluding the leading size[2] field
    pub fn size(&self, dotu: bool) -> u16 {
        let mut size = 2
            + 4
            + Qid::SIZE as usize
            + 4
            + 4
            + 4
            + 8
            + (2 + self.name.len())
            + (2 + self.uid.len())
            + (2 + self.gid.len())
            + (2 + self.muid.len());

        if dotu {
            size += (2 + self.ext.len()) + 4 + 4 + 4;
        }

        size as u16
    }
}

/// Data type used in `Rread` and `Twrite`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        Tversion        = 100,
        Rversion,
        Tauth           = 102,
        Rauth,
        Tattach         = 104,
        Rattach,
        Terror          = 106,  // Illegal, never sent
        Rerror,
        Tflush          = 108,
        Rflush,
        Twalk           = 110,
        Rwalk,
        Topen           = 112,
        Ropen,
        Tcreate         = 114,
        Rcreate,
        Tread           = 116,
        Rread,
        Twrite          = 118,
        Rwrite,
        Tclunk          = 120,
        Rclunk,
        Tremove         = 122,
        Rremove,
        Tstat           = 124,
        Rstat,
        Twstat          = 126,
        Rwstat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    ///
    /// In 9P2000 every R type is the odd successor of its T type.
    pub fn is_r(&self) -> bool {
        (*self as u8) & 1 == 1
    }
}

impl<'a> From<&'a Fcall> for MsgType {
    fn from(fcall: &'a Fcall) -> MsgType {
        match *fcall {
            Fcall::Tversion { .. } => MsgType::Tversion,
            Fcall::Rversion { .. } => MsgType::Rversion,
            Fcall::Tauth { .. } => MsgType::Tauth,
            Fcall::Rauth { .. } => MsgType::Rauth,
            Fcall::Tattach { .. } => MsgType::Tattach,
            Fcall::Rattach { .. } => MsgType::Rattach,
            Fcall::Rerror { .. } => MsgType::Rerror,
            Fcall::Tflush { .. } => MsgType::Tflush,
            Fcall::Rflush => MsgType::Rflush,
            Fcall::Twalk { .. } => MsgType::Twalk,
            Fcall::Rwalk { .. } => MsgType::Rwalk,
            Fcall::Topen { .. } => MsgType::Topen,
            Fcall::Ropen { .. } => MsgType::Ropen,
            Fcall::Tcreate { .. } => MsgType::Tcreate,
            Fcall::Rcreate { .. } => MsgType::Rcreate,
            Fcall::Tread { .. } => MsgType::Tread,
            Fcall::Rread { .. } => MsgType::Rread,
            Fcall::Twrite { .. } => MsgType::Twrite,
            Fcall::Rwrite { .. } => MsgType::Rwrite,
            Fcall::Tclunk { .. } => MsgType::Tclunk,
            Fcall::Rclunk => MsgType::Rclunk,
            Fcall::Tremove { .. } => MsgType::Tremove,
            Fcall::Rremove => MsgType::Rremove,
            Fcall::Tstat { .. } => MsgType::Tstat,
            Fcall::Rstat { .. } => MsgType::Rstat,
            Fcall::Twstat { .. } => MsgType::Twstat,
            Fcall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
        /// Numeric user id; only on the wire under 9P2000.u
        n_uname: u32,
    },
    Rauth {
        aqid: Qid,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        /// Numeric user id; only on the wire under 9P2000.u
        n_uname: u32,
    },
    Rattach {
        qid: Qid,
    },
    Rerror {
        ename: String,
        /// POSIX errno; only on the wire under 9P2000.u
        errno: u32,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<Qid>,
    },
    Topen {
        fid: u32,
        mode: u8,
    },
    Ropen {
        qid: Qid,
        iounit: u32,
    },
    Tcreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
        /// Special file description; only on the wire under 9P2000.u
        ext: String,
    },
    Rcreate {
        qid: Qid,
        iounit: u32,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Data,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
    Tstat {
        fid: u32,
    },
    Rstat {
        stat: Stat,
    },
    Twstat {
        fid: u32,
        stat: Stat,
    },
    Rwstat,
}

impl Fcall {
    /// Get the existing fid a T-message operates on
    ///
    /// `Tattach`, `Tauth` and `Twalk` allocate fids instead; see
    /// [`Fcall::newfid`]. The afid referenced by `Tattach` is resolved
    /// separately by the attach preamble.
    pub fn fid(&self) -> Option<u32> {
        match *self {
            Fcall::Twalk { fid, .. } => Some(fid),
            Fcall::Topen { fid, .. } => Some(fid),
            Fcall::Tcreate { fid, .. } => Some(fid),
            Fcall::Tread { fid, .. } => Some(fid),
            Fcall::Twrite { fid, .. } => Some(fid),
            Fcall::Tclunk { fid } => Some(fid),
            Fcall::Tremove { fid } => Some(fid),
            Fcall::Tstat { fid } => Some(fid),
            Fcall::Twstat { fid, .. } => Some(fid),
            _ => None,
        }
    }

    /// Get the fid a T-message would newly allocate
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            Fcall::Tauth { afid, .. } => Some(afid),
            Fcall::Tattach { fid, .. } => Some(fid),
            Fcall::Twalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }

    /// Get the qids an R-message carries
    pub fn qids(&self) -> Vec<Qid> {
        match *self {
            Fcall::Rauth { aqid } => vec![aqid],
            Fcall::Rattach { qid } => vec![qid],
            Fcall::Ropen { qid, .. } => vec![qid],
            Fcall::Rcreate { qid, .. } => vec![qid],
            Fcall::Rwalk { ref wqids } => wqids.clone(),
            Fcall::Rstat { ref stat } => vec![stat.qid],
            _ => Vec::new(),
        }
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}
