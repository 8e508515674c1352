//! Serialize/deserialize 9P messages into/from binary.
//!
//! The 4-byte frame length is not handled here; both engines delegate it to
//! a length-delimited codec on the transport. `read_msg`/`write_msg` cover
//! type[1] tag[2] body[...], with the dialect-dependent fields (Rerror's
//! errno, Tauth/Tattach's n_uname, Tcreate's extension and the stat tail)
//! switched by the `dotu` flag negotiated in Tversion.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Write one stat record: size[2] followed by the fields.
///
/// The record's own size field is part of the record, so a stat embedded in
/// Rstat/Twstat appears with two leading sizes on the wire. Directory reads
/// return a sequence of these records; servers assemble them with this
/// function and clients take them apart with [`read_stat`].
pub fn write_stat<W: WriteBytesExt>(w: &mut W, stat: &Stat, dotu: bool) -> Result<usize> {
    let buf = Encoder::new(w)
        << &stat.size(dotu)
        << &stat.typ
        << &stat.dev
        << &stat.qid
        << &stat.mode
        << &stat.atime
        << &stat.mtime
        << &stat.length
        << &stat.name
        << &stat.uid
        << &stat.gid
        << &stat.muid;

    let buf = if dotu {
        buf << &stat.ext << &stat.n_uid << &stat.n_gid << &stat.n_muid
    } else {
        buf
    };

    match buf {
        SResult(Ok(enc)) => Ok(enc.bytes_written()),
        SResult(Err(e)) => Err(e),
    }
}

/// Read one stat record (its leading size[2] included).
pub fn read_stat<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Stat> {
    let mut buf = r;

    let _size: u16 = decode!(buf);
    let mut stat = Stat {
        typ: decode!(buf),
        dev: decode!(buf),
        qid: decode!(buf),
        mode: decode!(buf),
        atime: decode!(buf),
        mtime: decode!(buf),
        length: decode!(buf),
        name: decode!(buf),
        uid: decode!(buf),
        gid: decode!(buf),
        muid: decode!(buf),
        ..Stat::default()
    };

    if dotu {
        stat.ext = decode!(buf);
        stat.n_uid = decode!(buf);
        stat.n_gid = decode!(buf);
        stat.n_muid = decode!(buf);
    } else {
        stat.n_uid = NOUID;
        stat.n_gid = NOUID;
        stat.n_muid = NOUID;
    }

    Ok(stat)
}

/// Write a 9P message into a byte-oriented stream
///
/// Returns the number of bytes written, excluding the frame length prefix.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, dotu: bool) -> Result<usize> {
    use crate::Fcall::*;

    let typ = MsgType::from(&msg.body);
    let buf = Encoder::new(w) << &(typ as u8) << &msg.tag;

    let buf = match msg.body {
        Tversion {
            ref msize,
            ref version,
        } => buf << msize << version,
        Rversion {
            ref msize,
            ref version,
        } => buf << msize << version,
        Tauth {
            ref afid,
            ref uname,
            ref aname,
            ref n_uname,
        } => {
            let buf = buf << afid << uname << aname;
            if dotu { buf << n_uname } else { buf }
        }
        Rauth { ref aqid } => buf << aqid,
        Tattach {
            ref fid,
            ref afid,
            ref uname,
            ref aname,
            ref n_uname,
        } => {
            let buf = buf << fid << afid << uname << aname;
            if dotu { buf << n_uname } else { buf }
        }
        Rattach { ref qid } => buf << qid,
        Rerror {
            ref ename,
            ref errno,
        } => {
            let buf = buf << ename;
            if dotu { buf << errno } else { buf }
        }
        Tflush { ref oldtag } => buf << oldtag,
        Rflush => buf,
        Twalk {
            ref fid,
            ref newfid,
            ref wnames,
        } => buf << fid << newfid << wnames,
        Rwalk { ref wqids } => buf << wqids,
        Topen { ref fid, ref mode } => buf << fid << mode,
        Ropen {
            ref qid,
            ref iounit,
        } => buf << qid << iounit,
        Tcreate {
            ref fid,
            ref name,
            ref perm,
            ref mode,
            ref ext,
        } => {
            let buf = buf << fid << name << perm << mode;
            if dotu { buf << ext } else { buf }
        }
        Rcreate {
            ref qid,
            ref iounit,
        } => buf << qid << iounit,
        Tread {
            ref fid,
            ref offset,
            ref count,
        } => buf << fid << offset << count,
        Rread { ref data } => buf << data,
        Twrite {
            ref fid,
            ref offset,
            ref data,
        } => buf << fid << offset << data,
        Rwrite { ref count } => buf << count,
        Tclunk { ref fid } => buf << fid,
        Rclunk => buf,
        Tremove { ref fid } => buf << fid,
        Rremove => buf,
        Tstat { ref fid } => buf << fid,
        Rstat { ref stat } => {
            // stat[n]: the record is itself size-prefixed
            match buf << &(stat.size(dotu) + 2) {
                SResult(Ok(mut enc)) => {
                    let record = write_stat(&mut enc.writer, stat, dotu)?;
                    enc.bytes += record;
                    SResult(Ok(enc))
                }
                e => e,
            }
        }
        Twstat { ref fid, ref stat } => match buf << fid << &(stat.size(dotu) + 2) {
            SResult(Ok(mut enc)) => {
                let record = write_stat(&mut enc.writer, stat, dotu)?;
                enc.bytes += record;
                SResult(Ok(enc))
            }
            e => e,
        },
        Rwstat => buf,
    };

    match buf {
        SResult(Ok(b)) => Ok(b.bytes_written()),
        SResult(Err(e)) => Err(e),
    }
}

/// Read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Msg> {
    use crate::MsgType::*;

    let mut buf = r;

    let msg_type = MsgType::from_u8(decode!(buf));
    let tag = decode!(buf);
    let body = match msg_type {
        Some(Tversion) => Fcall::Tversion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(Rversion) => Fcall::Rversion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(Tauth) => Fcall::Tauth {
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
            n_uname: if dotu { decode!(buf) } else { NOUID },
        },
        Some(Rauth) => Fcall::Rauth { aqid: decode!(buf) },
        Some(Tattach) => Fcall::Tattach {
            fid: decode!(buf),
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
            n_uname: if dotu { decode!(buf) } else { NOUID },
        },
        Some(Rattach) => Fcall::Rattach { qid: decode!(buf) },
        Some(Rerror) => Fcall::Rerror {
            ename: decode!(buf),
            errno: if dotu { decode!(buf) } else { 0 },
        },
        Some(Tflush) => Fcall::Tflush {
            oldtag: decode!(buf),
        },
        Some(Rflush) => Fcall::Rflush,
        Some(Twalk) => Fcall::Twalk {
            fid: decode!(buf),
            newfid: decode!(buf),
            wnames: decode!(buf),
        },
        Some(Rwalk) => Fcall::Rwalk {
            wqids: decode!(buf),
        },
        Some(Topen) => Fcall::Topen {
            fid: decode!(buf),
            mode: decode!(buf),
        },
        Some(Ropen) => Fcall::Ropen {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(Tcreate) => Fcall::Tcreate {
            fid: decode!(buf),
            name: decode!(buf),
            perm: decode!(buf),
            mode: decode!(buf),
            ext: if dotu { decode!(buf) } else { String::new() },
        },
        Some(Rcreate) => Fcall::Rcreate {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(Tread) => Fcall::Tread {
            fid: decode!(buf),
            offset: decode!(buf),
            count: decode!(buf),
        },
        Some(Rread) => Fcall::Rread { data: decode!(buf) },
        Some(Twrite) => Fcall::Twrite {
            fid: decode!(buf),
            offset: decode!(buf),
            data: decode!(buf),
        },
        Some(Rwrite) => Fcall::Rwrite {
            count: decode!(buf),
        },
        Some(Tclunk) => Fcall::Tclunk { fid: decode!(buf) },
        Some(Rclunk) => Fcall::Rclunk,
        Some(Tremove) => Fcall::Tremove { fid: decode!(buf) },
        Some(Rremove) => Fcall::Rremove,
        Some(Tstat) => Fcall::Tstat { fid: decode!(buf) },
        Some(Rstat) => {
            let _nstat: u16 = decode!(buf);
            Fcall::Rstat {
                stat: read_stat(&mut buf, dotu)?,
            }
        }
        Some(Twstat) => {
            let fid = decode!(buf);
            let _nstat: u16 = decode!(buf);
            Fcall::Twstat {
                fid,
                stat: read_stat(&mut buf, dotu)?,
            }
        }
        Some(Rwstat) => Fcall::Rwstat,
        Some(Terror) | None => return res!(io_err!(Other, "Invalid message type")),
    };

    Ok(Msg { tag, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: &Msg, dotu: bool) -> Msg {
        let mut buf = Vec::new();
        let n = write_msg(&mut buf, msg, dotu).unwrap();
        assert_eq!(n, buf.len());

        let mut readbuf = Cursor::new(buf);
        read_msg(&mut readbuf, dotu).unwrap()
    }

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn decoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut decoder = Cursor::new(expected.clone());
        let mut actual: Vec<u8> = Vec::new();
        while let Ok(i) = Decodable::decode(&mut decoder) {
            actual.push(i);
        }
        assert_eq!(expected, actual);
    }

    #[test]
    fn msg_encode_decode1() {
        let expected = Msg {
            tag: NOTAG,
            body: Fcall::Rversion {
                msize: DEFAULT_MSIZE,
                version: P92000U.to_owned(),
            },
        };

        assert_eq!(expected, roundtrip(&expected, true));
        assert_eq!(expected, roundtrip(&expected, false));
    }

    #[test]
    fn attach_dotu_fields() {
        let expected = Msg {
            tag: 1,
            body: Fcall::Tattach {
                fid: 0,
                afid: NOFID,
                uname: "glenda".to_owned(),
                aname: String::new(),
                n_uname: 1001,
            },
        };

        assert_eq!(expected, roundtrip(&expected, true));

        // without dotu the numeric id is not carried on the wire
        let decoded = roundtrip(&expected, false);
        match decoded.body {
            Fcall::Tattach { n_uname, .. } => assert_eq!(n_uname, NOUID),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn rerror_dotu_fields() {
        let expected = Msg {
            tag: 7,
            body: Fcall::Rerror {
                ename: "unknown fid".to_owned(),
                errno: 22,
            },
        };

        assert_eq!(expected, roundtrip(&expected, true));

        let decoded = roundtrip(&expected, false);
        match decoded.body {
            Fcall::Rerror { ref ename, errno } => {
                assert_eq!(ename, "unknown fid");
                assert_eq!(errno, 0);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn walk_roundtrip() {
        let expected = Msg {
            tag: 3,
            body: Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["usr".to_owned(), "glenda".to_owned()],
            },
        };
        assert_eq!(expected, roundtrip(&expected, false));

        let reply = Msg {
            tag: 3,
            body: Fcall::Rwalk {
                wqids: vec![
                    Qid {
                        typ: QidType::DIR,
                        version: 0,
                        path: 11,
                    },
                    Qid {
                        typ: QidType::DIR,
                        version: 0,
                        path: 12,
                    },
                ],
            },
        };
        assert_eq!(reply, roundtrip(&reply, false));
    }

    #[test]
    fn read_write_payload() {
        let msg = Msg {
            tag: 4,
            body: Fcall::Twrite {
                fid: 2,
                offset: 4096,
                data: Data(vec![0xde, 0xad, 0xbe, 0xef]),
            },
        };
        assert_eq!(msg, roundtrip(&msg, true));

        let msg = Msg {
            tag: 4,
            body: Fcall::Rread {
                data: Data(Vec::new()),
            },
        };
        assert_eq!(msg, roundtrip(&msg, true));
    }

    #[test]
    fn stat_double_size_prefix() {
        let stat = Stat {
            qid: Qid {
                typ: QidType::FILE,
                version: 1,
                path: 42,
            },
            mode: 0o644,
            length: 512,
            name: "motd".to_owned(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "glenda".to_owned(),
            ..Stat::default()
        };

        for dotu in [false, true] {
            let msg = Msg {
                tag: 9,
                body: Fcall::Rstat { stat: stat.clone() },
            };

            let mut buf = Vec::new();
            write_msg(&mut buf, &msg, dotu).unwrap();

            // type[1] tag[2] nstat[2], then the record with its own size[2]
            let nstat = u16::from_le_bytes([buf[3], buf[4]]);
            let rsize = u16::from_le_bytes([buf[5], buf[6]]);
            assert_eq!(nstat, stat.size(dotu) + 2);
            assert_eq!(rsize, stat.size(dotu));
            assert_eq!(buf.len(), 5 + nstat as usize);

            let decoded = roundtrip(&msg, dotu);
            match decoded.body {
                Fcall::Rstat { stat: ref got } => {
                    assert_eq!(got.name, stat.name);
                    assert_eq!(got.length, stat.length);
                    if !dotu {
                        assert_eq!(got.n_uid, NOUID);
                    }
                }
                other => panic!("unexpected body: {:?}", other),
            }
        }
    }

    #[test]
    fn wstat_roundtrip() {
        let msg = Msg {
            tag: 5,
            body: Fcall::Twstat {
                fid: 3,
                stat: Stat {
                    typ: !0,
                    dev: !0,
                    qid: Qid {
                        typ: QidType::from_bits_truncate(0xff),
                        version: !0,
                        path: !0,
                    },
                    mode: 0o755,
                    atime: !0,
                    mtime: !0,
                    length: !0,
                    name: "newname".to_owned(),
                    ext: "target".to_owned(),
                    n_uid: 1001,
                    ..Stat::default()
                },
            },
        };
        assert_eq!(msg, roundtrip(&msg, true));
    }
}
