//! Asynchronous client side 9P library.
//!
//! # Protocol
//! 9P2000/9P2000.u
//!
//! A [`Clnt`] owns a connected transport and multiplexes concurrent RPCs
//! over it: requests are written in submission order by a send task, replies
//! are correlated by tag in a receive task and handed back to the awaiting
//! caller. The fid-level methods (`attach`, `walk`, `open`, ...) compose the
//! raw [`Clnt::rpc`] round-trip into the usual 9P verbs.

use {
    crate::{
        error::{Errno, Error, string as estr},
        fcall::*,
        io_err, res, serialize,
        user::User,
        utils::{self, Result},
    },
    bytes::{Buf, Bytes},
    futures::sink::SinkExt,
    log::{debug, error},
    std::{
        collections::{HashMap, VecDeque},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::{mpsc, oneshot, watch},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

/// How many freed ids a pool keeps around for reuse.
///
/// Returns beyond this are discarded; the high-water mark is authoritative.
const POOL_RECYCLE: usize = 256;

struct PoolState {
    next: u32,
    freed: VecDeque<u32>,
}

/// Allocator for tags and fids over [0, sentinel).
///
/// Freed ids are preferred; otherwise a monotonic high-water mark advances,
/// never issuing the reserved sentinel (`NOTAG`/`NOFID`).
struct Pool {
    sentinel: u32,
    state: Mutex<PoolState>,
}

impl Pool {
    fn new(sentinel: u32) -> Pool {
        Pool {
            sentinel,
            state: Mutex::new(PoolState {
                next: 0,
                freed: VecDeque::new(),
            }),
        }
    }

    fn get_id(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.freed.pop_front() {
            return id;
        }

        if state.next == self.sentinel {
            state.next = 0;
        }

        let id = state.next;
        state.next = state.next.wrapping_add(1);
        id
    }

    fn put_id(&self, id: u32) {
        let mut state = self.state.lock().unwrap();
        if state.freed.len() < POOL_RECYCLE {
            state.freed.push_back(id);
        }
    }
}

/// A Fid type represents a file on the server. Fids are used for the
/// low level methods that correspond directly to the 9P2000 message requests
#[derive(Debug)]
pub struct Fid {
    /// Fid number
    pub fid: u32,
    /// The qid description for the file, once attached or walked
    pub qid: Qid,
    /// Maximum I/O size usable on this fid once opened
    pub iounit: u32,
    /// Open mode (one of the om::* values), if the file is open
    pub mode: Option<u8>,
    /// The user the fid belongs to
    pub user: Option<Arc<dyn User>>,
    /// True if the fid points to a walked file on the server
    walked: bool,
}

struct Pending {
    ttype: u8,
    tx: oneshot::Sender<Result<Fcall>>,
}

/// An RPC submitted with [`Clnt::rpc_nb`], awaiting its reply.
pub struct Req {
    tag: u16,
    rx: oneshot::Receiver<Result<Fcall>>,
}

impl Req {
    /// The tag assigned to this request.
    pub fn tag(&self) -> u16 {
        self.tag
    }
}

/// The Clnt type represents a 9P2000 client. The client is connected to
/// a 9P2000 file server and its methods can be used to access and manipulate
/// the files exported by the server.
pub struct Clnt {
    msize: AtomicU32,
    dotu: AtomicBool,
    tagpool: Pool,
    fidpool: Pool,
    reqout: mpsc::UnboundedSender<Bytes>,
    pending: Mutex<HashMap<u16, Pending>>,
    err: Mutex<Option<(String, Errno)>>,
    done: watch::Sender<bool>,
}

impl Clnt {
    /// Creates and initializes a new client over an already-connected
    /// transport. Doesn't send any data on the wire; spawns the send and
    /// receive tasks.
    pub fn new<R, W>(reader: R, writer: W, msize: u32, dotu: bool) -> Arc<Clnt>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (reqout, reqin) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(false);

        let clnt = Arc::new(Clnt {
            msize: AtomicU32::new(msize),
            dotu: AtomicBool::new(dotu),
            tagpool: Pool::new(u32::from(NOTAG)),
            fidpool: Pool::new(NOFID),
            reqout,
            pending: Mutex::new(HashMap::new()),
            err: Mutex::new(None),
            done,
        });

        tokio::spawn(Clnt::send_loop(
            clnt.clone(),
            writer,
            reqin,
            clnt.done.subscribe(),
        ));
        tokio::spawn(Clnt::recv_loop(clnt.clone(), reader, clnt.done.subscribe()));

        clnt
    }

    /// Creates a client and negotiates the dialect and msize for the
    /// connection: proposes `msize` and 9P2000.u iff `dotu`, and keeps the
    /// minimum of the two sizes and the dialect only if the server agreed.
    pub async fn connect<R, W>(reader: R, writer: W, msize: u32, dotu: bool) -> Result<Arc<Clnt>>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let clnt = Clnt::new(reader, writer, msize, dotu);
        let version = if dotu { P92000U } else { P92000 };

        let rc = clnt
            .rpc(Fcall::Tversion {
                msize,
                version: version.to_owned(),
            })
            .await?;

        match rc {
            Fcall::Rversion {
                msize: rmsize,
                version: rversion,
            } => {
                if rmsize < msize {
                    clnt.msize.store(rmsize, Ordering::SeqCst);
                }
                clnt.dotu
                    .store(rversion == P92000U && dotu, Ordering::SeqCst);
                Ok(clnt)
            }
            _ => Err(Error::proto(estr::EINVALRESP, Errno::EINVAL)),
        }
    }

    /// Negotiated maximum message size
    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::SeqCst)
    }

    /// True if the 9P2000.u dialect is spoken
    pub fn dotu(&self) -> bool {
        self.dotu.load(Ordering::SeqCst)
    }

    /// Closes the connection to the file server. Every pending and
    /// subsequent RPC fails with a connection-closed error.
    pub fn unmount(&self) {
        self.set_err(estr::ECLOSED, Errno::EIO);
        let _ = self.done.send(true);
    }

    /// Creates a new fid for the client. The fid refers to nothing on the
    /// server until used in `auth`, `attach` or `walk`.
    pub fn fid_alloc(&self) -> Fid {
        Fid {
            fid: self.fidpool.get_id(),
            qid: Qid::default(),
            iounit: 0,
            mode: None,
            user: None,
            walked: false,
        }
    }

    /// Submits a request without waiting for the reply. The caller awaits
    /// [`Clnt::rpc_done`] on the returned record.
    pub fn rpc_nb(&self, tc: Fcall) -> Result<Req> {
        let ttype = MsgType::from(&tc);
        let tag = if ttype == MsgType::Tversion {
            NOTAG
        } else {
            self.tagpool.get_id() as u16
        };

        if let Some(err) = self.conn_err() {
            if tag != NOTAG {
                self.tagpool.put_id(u32::from(tag));
            }
            return Err(err);
        }

        let msg = Msg { tag, body: tc };
        let mut buf = Vec::with_capacity(64);
        if let Err(e) = serialize::write_msg(&mut buf, &msg, self.dotu()) {
            if tag != NOTAG {
                self.tagpool.put_id(u32::from(tag));
            }
            return Err(e.into());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            tag,
            Pending {
                ttype: ttype as u8,
                tx,
            },
        );

        debug!("→ {:?}", msg);
        if self.reqout.send(Bytes::from(buf)).is_err() {
            self.pending.lock().unwrap().remove(&tag);
            if tag != NOTAG {
                self.tagpool.put_id(u32::from(tag));
            }
            return Err(self
                .conn_err()
                .unwrap_or_else(|| Error::proto(estr::ECLOSED, Errno::EIO)));
        }

        Ok(Req { tag, rx })
    }

    /// Awaits the reply to a request submitted with [`Clnt::rpc_nb`] and
    /// returns its tag to the pool.
    pub async fn rpc_done(&self, req: Req) -> Result<Fcall> {
        let result = req.rx.await;

        if req.tag != NOTAG {
            self.tagpool.put_id(u32::from(req.tag));
        }

        match result {
            Ok(r) => r,
            // the engine went away without completing the request
            Err(_) => Err(self
                .conn_err()
                .unwrap_or_else(|| Error::proto(estr::ECLOSED, Errno::EIO))),
        }
    }

    /// Synchronous round-trip: submits the T-message and returns the
    /// matching R-message, or the error the server (or the connection)
    /// reported.
    pub async fn rpc(&self, tc: Fcall) -> Result<Fcall> {
        let req = self.rpc_nb(tc)?;
        self.rpc_done(req).await
    }

    /*
     * Fid-level 9P verbs.
     */

    /// Creates an authentication fid for the specified user.
    pub async fn auth(&self, user: &Arc<dyn User>, aname: &str) -> Result<Fid> {
        let mut fid = self.fid_alloc();
        let rc = self
            .rpc(Fcall::Tauth {
                afid: fid.fid,
                uname: user.name().to_owned(),
                aname: aname.to_owned(),
                n_uname: user.id(),
            })
            .await;

        match rc {
            Ok(Fcall::Rauth { aqid }) => {
                fid.qid = aqid;
                fid.user = Some(user.clone());
                fid.walked = true;
                Ok(fid)
            }
            Ok(_) => {
                self.fidpool.put_id(fid.fid);
                Err(Error::proto(estr::EINVALRESP, Errno::EINVAL))
            }
            Err(e) => {
                self.fidpool.put_id(fid.fid);
                Err(e)
            }
        }
    }

    /// Creates a fid for the specified user that points to the root
    /// of the file server's file tree.
    pub async fn attach(
        &self,
        afid: Option<&Fid>,
        user: &Arc<dyn User>,
        aname: &str,
    ) -> Result<Fid> {
        let afno = afid.map_or(NOFID, |f| f.fid);

        let mut fid = self.fid_alloc();
        let rc = self
            .rpc(Fcall::Tattach {
                fid: fid.fid,
                afid: afno,
                uname: user.name().to_owned(),
                aname: aname.to_owned(),
                n_uname: user.id(),
            })
            .await;

        match rc {
            Ok(Fcall::Rattach { qid }) => {
                fid.qid = qid;
                fid.user = Some(user.clone());
                fid.walked = true;
                Ok(fid)
            }
            Ok(_) => {
                self.fidpool.put_id(fid.fid);
                Err(Error::proto(estr::EINVALRESP, Errno::EINVAL))
            }
            Err(e) => {
                self.fidpool.put_id(fid.fid);
                Err(e)
            }
        }
    }

    /// Walks from `fid` along the named path elements and returns a new fid
    /// for the destination. An empty path clones the fid. Walks longer than
    /// `MAXWELEM` elements are split over several Twalk messages.
    ///
    /// A partial walk (the server matched fewer elements than requested)
    /// is reported as ENOENT; the partially-walked fid is released.
    pub async fn walk(&self, fid: &Fid, wnames: &[&str]) -> Result<Fid> {
        let mut newfid = self.fid_alloc();
        newfid.user = fid.user.clone();
        newfid.qid = fid.qid;

        let mut from = fid.fid;
        let mut first = true;

        // split the path into MAXWELEM-sized steps; the first step walks
        // from the source fid, later steps continue from newfid itself
        let mut names = wnames;
        loop {
            let step: Vec<String> = names
                .iter()
                .take(MAXWELEM)
                .map(|s| (*s).to_owned())
                .collect();
            let nstep = step.len();

            let rc = self
                .rpc(Fcall::Twalk {
                    fid: from,
                    newfid: newfid.fid,
                    wnames: step,
                })
                .await;

            match rc {
                Ok(Fcall::Rwalk { wqids }) => {
                    if wqids.len() != nstep {
                        // partial walk: the server did not move newfid
                        if first {
                            self.fidpool.put_id(newfid.fid);
                        } else {
                            let _ = self.clunk(newfid).await;
                        }
                        return Err(Errno::ENOENT.into());
                    }

                    if let Some(q) = wqids.last() {
                        newfid.qid = *q;
                    }
                    newfid.walked = true;
                }
                Ok(_) => {
                    if first {
                        self.fidpool.put_id(newfid.fid);
                    } else {
                        let _ = self.clunk(newfid).await;
                    }
                    return Err(Error::proto(estr::EINVALRESP, Errno::EINVAL));
                }
                Err(e) => {
                    if first {
                        self.fidpool.put_id(newfid.fid);
                    } else {
                        let _ = self.clunk(newfid).await;
                    }
                    return Err(e);
                }
            }

            names = &names[nstep..];
            if names.is_empty() {
                return Ok(newfid);
            }

            from = newfid.fid;
            first = false;
        }
    }

    /// Opens the file the fid points to.
    pub async fn open(&self, fid: &mut Fid, mode: u8) -> Result<()> {
        let rc = self.rpc(Fcall::Topen { fid: fid.fid, mode }).await?;

        match rc {
            Fcall::Ropen { qid, iounit } => {
                fid.qid = qid;
                fid.iounit = if iounit == 0 {
                    self.msize().saturating_sub(IOHDRSZ)
                } else {
                    iounit
                };
                fid.mode = Some(mode);
                Ok(())
            }
            _ => Err(Error::proto(estr::EINVALRESP, Errno::EINVAL)),
        }
    }

    /// Creates a file named `name` in the directory the fid points to; on
    /// success the fid points to the new file, open with `mode`. `ext`
    /// describes special files under 9P2000.u and is ignored otherwise.
    pub async fn create(
        &self,
        fid: &mut Fid,
        name: &str,
        perm: u32,
        mode: u8,
        ext: &str,
    ) -> Result<()> {
        let rc = self
            .rpc(Fcall::Tcreate {
                fid: fid.fid,
                name: name.to_owned(),
                perm,
                mode,
                ext: ext.to_owned(),
            })
            .await?;

        match rc {
            Fcall::Rcreate { qid, iounit } => {
                fid.qid = qid;
                fid.iounit = if iounit == 0 {
                    self.msize().saturating_sub(IOHDRSZ)
                } else {
                    iounit
                };
                fid.mode = Some(mode);
                Ok(())
            }
            _ => Err(Error::proto(estr::EINVALRESP, Errno::EINVAL)),
        }
    }

    /// Reads up to `count` bytes at `offset`. The count is capped to what
    /// fits in a single message.
    pub async fn read(&self, fid: &Fid, offset: u64, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.msize().saturating_sub(IOHDRSZ));
        let rc = self
            .rpc(Fcall::Tread {
                fid: fid.fid,
                offset,
                count,
            })
            .await?;

        match rc {
            Fcall::Rread { data } => Ok(data.0),
            _ => Err(Error::proto(estr::EINVALRESP, Errno::EINVAL)),
        }
    }

    /// Writes `data` at `offset`, returning the number of bytes the server
    /// accepted. At most one message worth of data is sent.
    pub async fn write(&self, fid: &Fid, offset: u64, data: &[u8]) -> Result<u32> {
        let n = (data.len() as u32).min(self.msize().saturating_sub(IOHDRSZ)) as usize;
        let rc = self
            .rpc(Fcall::Twrite {
                fid: fid.fid,
                offset,
                data: Data(data[..n].to_vec()),
            })
            .await?;

        match rc {
            Fcall::Rwrite { count } => Ok(count),
            _ => Err(Error::proto(estr::EINVALRESP, Errno::EINVAL)),
        }
    }

    /// Releases the fid. The fid number returns to the pool whether or not
    /// the server reported an error; a fid that never pointed to a file on
    /// the server is released locally.
    pub async fn clunk(&self, fid: Fid) -> Result<()> {
        let result = if fid.walked {
            self.rpc(Fcall::Tclunk { fid: fid.fid }).await.map(|_| ())
        } else {
            Ok(())
        };

        self.fidpool.put_id(fid.fid);
        result
    }

    /// Removes the file the fid points to and releases the fid.
    pub async fn remove(&self, fid: Fid) -> Result<()> {
        let result = self.rpc(Fcall::Tremove { fid: fid.fid }).await.map(|_| ());
        self.fidpool.put_id(fid.fid);
        result
    }

    /// Returns the metadata for the file associated with the fid.
    pub async fn stat(&self, fid: &Fid) -> Result<Stat> {
        let rc = self.rpc(Fcall::Tstat { fid: fid.fid }).await?;

        match rc {
            Fcall::Rstat { stat } => Ok(stat),
            _ => Err(Error::proto(estr::EINVALRESP, Errno::EINVAL)),
        }
    }

    /// Modifies the metadata of the file associated with the fid.
    pub async fn wstat(&self, fid: &Fid, stat: &Stat) -> Result<()> {
        self.rpc(Fcall::Twstat {
            fid: fid.fid,
            stat: stat.clone(),
        })
        .await
        .map(|_| ())
    }

    /*
     * Engine internals.
     */

    fn set_err(&self, ename: &str, errno: Errno) {
        let mut err = self.err.lock().unwrap();
        if err.is_none() {
            *err = Some((ename.to_owned(), errno));
        }
    }

    fn conn_err(&self) -> Option<Error> {
        self.err
            .lock()
            .unwrap()
            .as_ref()
            .map(|(ename, errno)| Error::proto(ename.clone(), *errno))
    }

    /// Fails every outstanding request with the connection's terminal error.
    fn fail_pending(&self) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };

        let (ename, errno) = self
            .err
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| (estr::ECLOSED.to_owned(), Errno::EIO));

        for p in drained {
            let _ = p.tx.send(Err(Error::proto(ename.clone(), errno)));
        }
    }

    async fn send_loop<W>(
        clnt: Arc<Clnt>,
        writer: W,
        mut reqin: mpsc::UnboundedReceiver<Bytes>,
        mut done: watch::Receiver<bool>,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(writer);

        loop {
            tokio::select! {
                _ = done.changed() => return,
                req = reqin.recv() => match req {
                    None => return,
                    Some(buf) => {
                        if let Err(e) = framed.send(buf).await {
                            error!("9p client write: {}", e);
                            clnt.set_err(&e.to_string(), Errno::EIO);
                            let _ = clnt.done.send(true);
                            return;
                        }
                    }
                },
            }
        }
    }

    async fn recv_loop<R>(clnt: Arc<Clnt>, reader: R, mut done: watch::Receiver<bool>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut framed = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_read(reader);

        loop {
            let frame = tokio::select! {
                _ = done.changed() => break,
                frame = framed.next() => frame,
            };

            let bytes = match frame {
                None => {
                    clnt.set_err(estr::ECLOSED, Errno::EIO);
                    break;
                }
                Some(Err(e)) => {
                    clnt.set_err(&e.to_string(), Errno::EIO);
                    break;
                }
                Some(Ok(bytes)) => bytes,
            };

            let msg = match serialize::read_msg(&mut bytes.reader(), clnt.dotu()) {
                Ok(msg) => msg,
                Err(e) => {
                    clnt.set_err(&e.to_string(), Errno::EIO);
                    break;
                }
            };
            debug!("← {:?}", msg);

            let entry = clnt.pending.lock().unwrap().remove(&msg.tag);
            let pending = match entry {
                Some(p) => p,
                None => {
                    clnt.set_err(estr::EUNEXPECTED, Errno::EINVAL);
                    break;
                }
            };

            let rtype = MsgType::from(&msg.body) as u8;
            let result = if rtype == pending.ttype + 1 {
                Ok(msg.body)
            } else if let Fcall::Rerror { ename, errno } = msg.body {
                Err(Error::proto(ename, Errno::from_raw(errno as i32)))
            } else {
                Err(Error::proto(estr::EINVALRESP, Errno::EINVAL))
            };

            let _ = pending.tx.send(result);
        }

        let _ = clnt.done.send(true);
        clnt.fail_pending();
    }
}

/// Connects to a file server at a `proto!addr!port` address, negotiates the
/// protocol and attaches to the file tree as `user`. Returns the client and
/// a fid pointing to the root of the tree.
pub async fn mount(addr: &str, aname: &str, user: &Arc<dyn User>) -> Result<(Arc<Clnt>, Fid)> {
    let (proto, dial) =
        utils::parse_proto(addr).ok_or_else(|| io_err!(InvalidInput, "Invalid address"))?;

    match proto {
        "tcp" => {
            let stream = TcpStream::connect(&dial).await?;
            mount_stream(stream, aname, user).await
        }
        "unix" => {
            let stream = UnixStream::connect(&dial).await?;
            mount_stream(stream, aname, user).await
        }
        _ => res!(io_err!(InvalidInput, "Protocol not supported")),
    }
}

/// Like [`mount`], over an already-connected stream.
pub async fn mount_stream<S>(stream: S, aname: &str, user: &Arc<dyn User>) -> Result<(Arc<Clnt>, Fid)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let clnt = Clnt::connect(reader, writer, DEFAULT_MSIZE, true).await?;

    match clnt.attach(None, user, aname).await {
        Ok(root) => Ok((clnt, root)),
        Err(e) => {
            clnt.unmount();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pool_ids_unique() {
        let pool = Pool::new(NOFID);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(pool.get_id()));
        }
    }

    #[test]
    fn pool_recycles_freed_ids() {
        let pool = Pool::new(NOFID);
        let a = pool.get_id();
        let b = pool.get_id();
        pool.put_id(a);
        pool.put_id(b);
        assert_eq!(pool.get_id(), a);
        assert_eq!(pool.get_id(), b);
    }

    #[test]
    fn pool_skips_sentinel() {
        let pool = Pool::new(3);
        assert_eq!(pool.get_id(), 0);
        assert_eq!(pool.get_id(), 1);
        assert_eq!(pool.get_id(), 2);
        // high-water mark reached the sentinel; it wraps rather than
        // issuing the reserved id
        assert_eq!(pool.get_id(), 0);
    }

    /// A hand-driven peer for exercising the engine without a real server.
    mod fakesrv {
        use super::super::*;
        use tokio::io::{ReadHalf, WriteHalf};
        use tokio_util::codec::{FramedRead, FramedWrite};

        pub type Reader = FramedRead<ReadHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>;
        pub type Writer = FramedWrite<WriteHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>;

        pub fn framed(stream: tokio::io::DuplexStream) -> (Reader, Writer) {
            let (r, w) = tokio::io::split(stream);
            let reader = LengthDelimitedCodec::builder()
                .length_field_offset(0)
                .length_field_length(4)
                .length_adjustment(-4)
                .little_endian()
                .new_read(r);
            let writer = LengthDelimitedCodec::builder()
                .length_field_offset(0)
                .length_field_length(4)
                .length_adjustment(-4)
                .little_endian()
                .new_write(w);
            (reader, writer)
        }

        pub async fn recv(reader: &mut Reader) -> Msg {
            let bytes = reader.next().await.unwrap().unwrap();
            serialize::read_msg(&mut bytes.reader(), false).unwrap()
        }

        pub async fn send(writer: &mut Writer, msg: &Msg) {
            let mut buf = Vec::new();
            serialize::write_msg(&mut buf, msg, false).unwrap();
            writer.send(Bytes::from(buf)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn replies_correlate_by_tag_out_of_order() {
        let (here, there) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(here);
        let clnt = Clnt::new(r, w, DEFAULT_MSIZE, false);

        let (mut srd, mut swr) = fakesrv::framed(there);

        let req1 = clnt
            .rpc_nb(Fcall::Tread {
                fid: 1,
                offset: 0,
                count: 1,
            })
            .unwrap();
        let req2 = clnt
            .rpc_nb(Fcall::Tread {
                fid: 2,
                offset: 0,
                count: 1,
            })
            .unwrap();

        let m1 = fakesrv::recv(&mut srd).await;
        let m2 = fakesrv::recv(&mut srd).await;
        assert_ne!(m1.tag, m2.tag);

        // answer in reverse submission order
        fakesrv::send(
            &mut swr,
            &Msg {
                tag: m2.tag,
                body: Fcall::Rread {
                    data: Data(vec![2]),
                },
            },
        )
        .await;
        fakesrv::send(
            &mut swr,
            &Msg {
                tag: m1.tag,
                body: Fcall::Rread {
                    data: Data(vec![1]),
                },
            },
        )
        .await;

        let rc1 = clnt.rpc_done(req1).await.unwrap();
        let rc2 = clnt.rpc_done(req2).await.unwrap();
        assert_eq!(rc1, Fcall::Rread { data: Data(vec![1]) });
        assert_eq!(rc2, Fcall::Rread { data: Data(vec![2]) });
    }

    #[tokio::test]
    async fn rerror_reply_maps_to_error() {
        let (here, there) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(here);
        let clnt = Clnt::new(r, w, DEFAULT_MSIZE, false);

        let (mut srd, mut swr) = fakesrv::framed(there);

        let req = clnt.rpc_nb(Fcall::Tclunk { fid: 9 }).unwrap();
        let m = fakesrv::recv(&mut srd).await;
        fakesrv::send(
            &mut swr,
            &Msg {
                tag: m.tag,
                body: Fcall::Rerror {
                    ename: estr::EUNKNOWNFID.to_owned(),
                    errno: 0,
                },
            },
        )
        .await;

        match clnt.rpc_done(req).await {
            Err(Error::Proto { ename, .. }) => assert_eq!(ename, estr::EUNKNOWNFID),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unexpected_tag_fails_all_pending() {
        let (here, there) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(here);
        let clnt = Clnt::new(r, w, DEFAULT_MSIZE, false);

        let (mut srd, mut swr) = fakesrv::framed(there);

        let req = clnt
            .rpc_nb(Fcall::Tread {
                fid: 1,
                offset: 0,
                count: 1,
            })
            .unwrap();

        let m = fakesrv::recv(&mut srd).await;
        fakesrv::send(
            &mut swr,
            &Msg {
                tag: m.tag.wrapping_add(7),
                body: Fcall::Rread {
                    data: Data(vec![0]),
                },
            },
        )
        .await;

        assert!(clnt.rpc_done(req).await.is_err());
        assert!(clnt.rpc(Fcall::Tclunk { fid: 1 }).await.is_err());
    }

    #[tokio::test]
    async fn unmount_fails_pending_and_subsequent() {
        let (here, _there) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(here);
        let clnt = Clnt::new(r, w, DEFAULT_MSIZE, false);

        let req = clnt
            .rpc_nb(Fcall::Tread {
                fid: 1,
                offset: 0,
                count: 1,
            })
            .unwrap();

        clnt.unmount();

        assert!(clnt.rpc_done(req).await.is_err());
        assert!(clnt.rpc(Fcall::Tclunk { fid: 1 }).await.is_err());
    }

    #[tokio::test]
    async fn tags_stay_unique_across_concurrent_rpcs() {
        let (here, there) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(here);
        let clnt = Clnt::new(r, w, DEFAULT_MSIZE, false);

        let (mut srd, mut swr) = fakesrv::framed(there);

        let mut reqs = Vec::new();
        for i in 0..32 {
            reqs.push(
                clnt.rpc_nb(Fcall::Tread {
                    fid: i,
                    offset: 0,
                    count: 1,
                })
                .unwrap(),
            );
        }

        let mut tags = HashSet::new();
        for _ in 0..32 {
            let m = fakesrv::recv(&mut srd).await;
            assert!(tags.insert(m.tag), "duplicate live tag {}", m.tag);
            fakesrv::send(
                &mut swr,
                &Msg {
                    tag: m.tag,
                    body: Fcall::Rread {
                        data: Data(Vec::new()),
                    },
                },
            )
            .await;
        }

        for req in reqs {
            clnt.rpc_done(req).await.unwrap();
        }
    }
}
