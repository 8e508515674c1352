//! Error representation for 9P endpoints.
//!
//! Every protocol-level failure is an ename plus a POSIX errno; the errno
//! only travels on the wire when the 9P2000.u dialect was negotiated, but it
//! is kept on every error so a connection can switch dialects without
//! reshaping its errors.

use std::{fmt, io};

pub use nix::errno::Errno;

/// Message texts of the canonical protocol errors.
pub mod string {
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const ENOUSER: &str = "unknown user";
    pub const ENOAUTH: &str = "no authentication required";
    pub const EBADUSE: &str = "bad use of fid";
    pub const ENOTDIR: &str = "not a directory";
    pub const EOPEN: &str = "fid already opened";
    pub const EPERM: &str = "permission denied";
    pub const ETOOLARGE: &str = "i/o count too large";
    pub const EBADOFFSET: &str = "bad offset in directory read";
    pub const ENOTIMPL: &str = "not implemented";
    pub const EINUSE: &str = "fid already in use";
    pub const EDIRCHANGE: &str = "cannot convert between files and directories";
    pub const EMSIZE: &str = "msize too small";
    pub const ECLOSED: &str = "connection closed";
    pub const EINVALRESP: &str = "invalid response";
    pub const EUNEXPECTED: &str = "unexpected response";
}

/// The error type of this crate.
#[derive(Debug)]
pub enum Error {
    /// A 9P error: the payload of an `Rerror` reply, either received from
    /// the peer or about to be sent to it.
    Proto { ename: String, errno: Errno },
    /// An I/O failure on the underlying transport.
    Io(io::Error),
}

impl Error {
    pub fn proto<S: Into<String>>(ename: S, errno: Errno) -> Error {
        Error::Proto {
            ename: ename.into(),
            errno,
        }
    }

    /// The errno reported under 9P2000.u; transport errors map to EIO.
    pub fn errno(&self) -> Errno {
        match *self {
            Error::Proto { errno, .. } => errno,
            Error::Io(_) => Errno::EIO,
        }
    }

    /*
     * Canonical errors produced by the dispatch preamble and preflight.
     */
    pub fn unknown_fid() -> Error {
        Error::proto(string::EUNKNOWNFID, Errno::EINVAL)
    }

    pub fn no_user() -> Error {
        Error::proto(string::ENOUSER, Errno::EINVAL)
    }

    pub fn no_auth() -> Error {
        Error::proto(string::ENOAUTH, Errno::EINVAL)
    }

    pub fn bad_use() -> Error {
        Error::proto(string::EBADUSE, Errno::EINVAL)
    }

    pub fn not_dir() -> Error {
        Error::proto(string::ENOTDIR, Errno::ENOTDIR)
    }

    pub fn already_open() -> Error {
        Error::proto(string::EOPEN, Errno::EINVAL)
    }

    pub fn perm() -> Error {
        Error::proto(string::EPERM, Errno::EPERM)
    }

    pub fn too_large() -> Error {
        Error::proto(string::ETOOLARGE, Errno::EINVAL)
    }

    pub fn bad_offset() -> Error {
        Error::proto(string::EBADOFFSET, Errno::EINVAL)
    }

    pub fn not_impl() -> Error {
        Error::proto(string::ENOTIMPL, Errno::EINVAL)
    }

    pub fn in_use() -> Error {
        Error::proto(string::EINUSE, Errno::EINVAL)
    }

    pub fn dir_change() -> Error {
        Error::proto(string::EDIRCHANGE, Errno::EINVAL)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Proto { ref ename, errno } => write!(f, "{} ({})", ename, errno),
            Error::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Proto { .. } => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::proto(errno.desc(), errno)
    }
}
