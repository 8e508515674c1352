//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000/9P2000.u
//!
//! The engine owns the connection loop, the fid table and the request
//! lifecycle; the backing behavior is supplied through the [`ReqOps`]
//! capability (plus the optional [`AuthOps`], [`FlushOp`], [`FidDestroyOp`]
//! and [`ReqProcessOps`] capabilities). Each inbound message is validated
//! against the per-fid state machine before the capability runs, and the
//! fid bookkeeping (type bits, open flag, directory offset, reference
//! counts) happens after the capability responds.
//!
//! Capabilities receive a [`Req`] and must call exactly one `respond_*`
//! method on it. A capability may stash the `Arc<Req>` and respond from
//! another task later; [`FlushOp::flush`] is how a `Tflush` nudges such a
//! request toward completion.

use {
    crate::{
        error::{Errno, Error, string as estr},
        fcall::*,
        io_err, serialize,
        user::{User, Users},
        utils::{self, Result},
    },
    async_trait::async_trait,
    bitflags::bitflags,
    bytes::{Buf, Bytes},
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::mpsc,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

bitflags! {
    /// Lifecycle bits of a request.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    struct ReqStatus: u8 {
        #[doc = "A task is currently working on the request"]
        const WORK      = 0x01;
        #[doc = "A response has been produced"]
        const RESPONDED = 0x02;
        #[doc = "The capability kept the request to respond later"]
        const SAVED     = 0x04;
        #[doc = "The request was flushed; its response must not reach the wire"]
        const FLUSH     = 0x08;
    }
}

#[derive(Default)]
struct FidState {
    user: Option<Arc<dyn User>>,
    typ: QidType,
    opened: bool,
    omode: u8,
    diroffset: u64,
}

/// A client-visible fid and the server state hanging off it.
///
/// The engine owns everything except `aux`, which belongs to the backing
/// capability (create per-fid handles there, the way the `Default` value
/// leaves room for).
pub struct Fid<A> {
    fid: u32,
    refcount: AtomicU32,
    state: Mutex<FidState>,
    /// Capability state associated with this fid.
    pub aux: A,
}

impl<A: Default> Fid<A> {
    fn new(fid: u32) -> Fid<A> {
        Fid {
            fid,
            refcount: AtomicU32::new(1),
            state: Mutex::new(FidState::default()),
            aux: A::default(),
        }
    }
}

impl<A> Fid<A> {
    /// The raw fid number chosen by the client.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The authenticated user the fid belongs to.
    pub fn user(&self) -> Option<Arc<dyn User>> {
        self.state.lock().unwrap().user.clone()
    }

    /// Qid type bits of the file the fid points to.
    pub fn qid_type(&self) -> QidType {
        self.state.lock().unwrap().typ
    }

    /// True once a Topen/Tcreate succeeded on this fid.
    pub fn is_opened(&self) -> bool {
        self.state.lock().unwrap().opened
    }

    /// The mode the fid was opened with (meaningful while opened).
    pub fn omode(&self) -> u8 {
        self.state.lock().unwrap().omode
    }

    /// Running byte offset of directory reads on this fid.
    pub fn diroffset(&self) -> u64 {
        self.state.lock().unwrap().diroffset
    }

    /// Current reference count.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    fn set_user(&self, user: Arc<dyn User>) {
        self.state.lock().unwrap().user = Some(user);
    }

    fn set_type(&self, typ: QidType) {
        self.state.lock().unwrap().typ = typ;
    }

    fn set_omode(&self, omode: u8) {
        self.state.lock().unwrap().omode = omode;
    }

    fn set_opened(&self, opened: bool) {
        self.state.lock().unwrap().opened = opened;
    }

    fn reset_diroffset(&self) {
        self.state.lock().unwrap().diroffset = 0;
    }

    fn add_diroffset(&self, n: u64) {
        self.state.lock().unwrap().diroffset += n;
    }
}

/// The required capability: the file-service behavior behind the engine.
///
/// Every method receives the request after its preflight validation passed
/// and must arrange for exactly one `respond_*` call on it, either before
/// returning or later from another task.
#[async_trait]
pub trait ReqOps: Send + Sync + Sized + 'static {
    /// Per-fid state handed to the capability through [`Fid::aux`].
    type Aux: Send + Sync + Default + 'static;

    async fn attach(&self, req: &Arc<Req<Self>>);
    async fn walk(&self, req: &Arc<Req<Self>>);
    async fn open(&self, req: &Arc<Req<Self>>);
    async fn create(&self, req: &Arc<Req<Self>>);
    async fn read(&self, req: &Arc<Req<Self>>);
    async fn write(&self, req: &Arc<Req<Self>>);
    async fn clunk(&self, req: &Arc<Req<Self>>);
    async fn remove(&self, req: &Arc<Req<Self>>);
    async fn stat(&self, req: &Arc<Req<Self>>);
    async fn wstat(&self, req: &Arc<Req<Self>>);

    /// Authentication support; servers without it answer Tauth with
    /// "no authentication required".
    fn auth_ops(&self) -> Option<&dyn AuthOps<Self::Aux>> {
        None
    }

    /// Cancellation support for requests the capability saved for later.
    fn flush_op(&self) -> Option<&dyn FlushOp<Self>> {
        None
    }

    /// Cleanup hook for fids whose reference count dropped to zero.
    fn fid_destroy_op(&self) -> Option<&dyn FidDestroyOp<Self::Aux>> {
        None
    }

    /// Hook wrapping the default dispatch pipeline.
    fn process_ops(&self) -> Option<&dyn ReqProcessOps<Self>> {
        None
    }
}

/// Optional authentication capability.
///
/// Reads, writes and clunks on an auth fid (QTAUTH set) are routed here and
/// never reach [`ReqOps`].
#[async_trait]
pub trait AuthOps<A: Send + Sync + 'static>: Send + Sync {
    /// Start authentication on a fresh afid; returns the auth file's qid.
    async fn auth_init(&self, afid: &Arc<Fid<A>>, aname: &str) -> Result<Qid>;

    /// Verify that the authentication carried by `afid` entitles the user
    /// to attach.
    async fn auth_check(&self, fid: &Arc<Fid<A>>, afid: Option<&Arc<Fid<A>>>, aname: &str)
    -> Result<()>;

    /// Read from the auth file; at most `count` bytes are delivered.
    async fn auth_read(&self, afid: &Arc<Fid<A>>, offset: u64, count: u32) -> Result<Vec<u8>>;

    /// Write to the auth file; returns the number of bytes consumed.
    async fn auth_write(&self, afid: &Arc<Fid<A>>, offset: u64, data: &[u8]) -> Result<u32>;

    /// The afid is being clunked.
    async fn auth_destroy(&self, afid: &Arc<Fid<A>>);
}

/// Optional cancellation capability.
#[async_trait]
pub trait FlushOp<Fs: ReqOps>: Send + Sync {
    /// Nudge the capability working on `req` toward completion. The target
    /// request must still respond exactly once; its response answers the
    /// flushes chained on it.
    async fn flush(&self, req: &Arc<Req<Fs>>);
}

/// Optional cleanup capability, called when a fid leaves the table.
pub trait FidDestroyOp<A>: Send + Sync {
    fn fid_destroy(&self, fid: &Fid<A>);
}

/// Optional hook around request dispatch.
#[async_trait]
pub trait ReqProcessOps<Fs: ReqOps>: Send + Sync {
    /// Called in place of the default pipeline; implementations usually
    /// wrap [`Req::process`].
    async fn req_process(&self, req: &Arc<Req<Fs>>);
}

/// Per-connection engine state.
pub struct Conn<Fs: ReqOps> {
    id: String,
    ops: Arc<Fs>,
    upool: Arc<dyn Users>,
    dotu_allowed: bool,
    msize: AtomicU32,
    dotu: AtomicBool,
    fids: Mutex<HashMap<u32, Arc<Fid<Fs::Aux>>>>,
    reqs: Mutex<HashMap<u16, Arc<Req<Fs>>>>,
    wchan: mpsc::UnboundedSender<Bytes>,
}

impl<Fs: ReqOps> Conn<Fs> {
    /// Peer label used in log lines.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::SeqCst)
    }

    /// True if the 9P2000.u dialect was negotiated.
    pub fn dotu(&self) -> bool {
        self.dotu.load(Ordering::SeqCst)
    }

    /// Insert a fresh fid; None signals the number is already in use.
    /// The new entry's reference count is 1, owned by the inserting request.
    fn fid_new(&self, fidno: u32) -> Option<Arc<Fid<Fs::Aux>>> {
        let mut fids = self.fids.lock().unwrap();
        if fids.contains_key(&fidno) {
            return None;
        }

        let fid = Arc::new(Fid::new(fidno));
        fids.insert(fidno, fid.clone());
        Some(fid)
    }

    /// Look up a fid, taking a reference for the requesting request.
    fn fid_get(&self, fidno: u32) -> Option<Arc<Fid<Fs::Aux>>> {
        let fids = self.fids.lock().unwrap();
        fids.get(&fidno).map(|fid| {
            fid.inc_ref();
            fid.clone()
        })
    }

    /// Drop a reference; on zero the fid leaves the table and the destroy
    /// capability runs.
    fn dec_ref(&self, fid: &Arc<Fid<Fs::Aux>>) {
        if fid.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        self.fids.lock().unwrap().remove(&fid.fid);
        if let Some(op) = self.ops.fid_destroy_op() {
            op.fid_destroy(fid);
        }
    }

    /// Serialize and hand a message to the writer task.
    fn send_msg(&self, msg: &Msg) {
        debug!("→ {} {:?}", self.id, msg);

        let mut buf = Vec::with_capacity(64);
        match serialize::write_msg(&mut buf, msg, self.dotu()) {
            Ok(_) => {
                let _ = self.wchan.send(Bytes::from(buf));
            }
            Err(e) => error!("{}: encoding {:?}: {}", self.id, MsgType::from(&msg.body), e),
        }
    }

    /// The connection's read/decode/dispatch loop. Returns when the peer
    /// hangs up or on a fatal protocol error.
    async fn read_loop<R>(self: Arc<Self>, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut framed = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_read(reader);

        let result = loop {
            let bytes = match framed.next().await {
                None => break Ok(()),
                Some(Err(e)) => break Err(Error::from(e)),
                Some(Ok(bytes)) => bytes,
            };

            // the writer task exits on transport errors; nothing more can
            // be answered, so the connection comes down
            if self.wchan.is_closed() {
                break Err(Error::proto(estr::ECLOSED, Errno::EIO));
            }

            let msg = match serialize::read_msg(&mut bytes.reader(), self.dotu()) {
                Ok(msg) => msg,
                Err(e) => break Err(Error::from(e)),
            };
            debug!("← {} {:?}", self.id, msg);

            if MsgType::from(&msg.body).is_r() {
                self.send_msg(&Msg {
                    tag: msg.tag,
                    body: rerror(&Error::proto("invalid message", Errno::EINVAL)),
                });
                continue;
            }

            let req = Arc::new(Req {
                conn: self.clone(),
                tag: msg.tag,
                tc: msg.body,
                rc: Mutex::new(None),
                fid: Mutex::new(None),
                afid: Mutex::new(None),
                newfid: Mutex::new(None),
                status: Mutex::new(ReqStatus::default()),
                flushreq: Mutex::new(Vec::new()),
            });

            {
                let mut reqs = self.reqs.lock().unwrap();
                if reqs.contains_key(&req.tag) {
                    drop(reqs);
                    // a live tag may not be reused
                    self.send_msg(&Msg {
                        tag: req.tag,
                        body: rerror(&Error::in_use()),
                    });
                    continue;
                }
                reqs.insert(req.tag, req.clone());
            }

            tokio::spawn(async move {
                let ops = req.conn.ops.clone();
                match ops.process_ops() {
                    Some(h) => h.req_process(&req).await,
                    None => req.process().await,
                }
            });
        };

        // break the Conn <-> Req cycle for requests that will never respond
        self.reqs.lock().unwrap().clear();

        result
    }
}

fn rerror(err: &Error) -> Fcall {
    match *err {
        Error::Proto { ref ename, errno } => Fcall::Rerror {
            ename: ename.clone(),
            errno: errno as u32,
        },
        Error::Io(ref e) => Fcall::Rerror {
            ename: e.to_string(),
            errno: Errno::EIO as u32,
        },
    }
}

/// One T-message moving through the engine.
pub struct Req<Fs: ReqOps> {
    conn: Arc<Conn<Fs>>,
    tag: u16,
    tc: Fcall,
    rc: Mutex<Option<Fcall>>,
    fid: Mutex<Option<Arc<Fid<Fs::Aux>>>>,
    afid: Mutex<Option<Arc<Fid<Fs::Aux>>>>,
    newfid: Mutex<Option<Arc<Fid<Fs::Aux>>>>,
    status: Mutex<ReqStatus>,
    flushreq: Mutex<Vec<Arc<Req<Fs>>>>,
}

impl<Fs: ReqOps> Req<Fs> {
    /// The connection the request arrived on.
    pub fn conn(&self) -> &Arc<Conn<Fs>> {
        &self.conn
    }

    /// The request's tag.
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// The inbound T-message.
    pub fn tc(&self) -> &Fcall {
        &self.tc
    }

    /// The fid the message operates on, resolved by the preamble.
    pub fn fid(&self) -> Option<Arc<Fid<Fs::Aux>>> {
        self.fid.lock().unwrap().clone()
    }

    /// The afid of a Tauth/Tattach.
    pub fn afid(&self) -> Option<Arc<Fid<Fs::Aux>>> {
        self.afid.lock().unwrap().clone()
    }

    /// The destination fid of a Twalk (the source fid itself for a clone
    /// walk with fid == newfid).
    pub fn newfid(&self) -> Option<Arc<Fid<Fs::Aux>>> {
        self.newfid.lock().unwrap().clone()
    }

    /*
     * Responses. Exactly one of these must run per request; the engine
     * logs and ignores any further attempt.
     */

    pub fn respond_error(&self, err: &Error) {
        self.respond(rerror(err));
    }

    pub fn respond_attach(&self, qid: Qid) {
        self.respond(Fcall::Rattach { qid });
    }

    pub fn respond_walk(&self, wqids: Vec<Qid>) {
        self.respond(Fcall::Rwalk { wqids });
    }

    pub fn respond_open(&self, qid: Qid, iounit: u32) {
        self.respond(Fcall::Ropen { qid, iounit });
    }

    pub fn respond_create(&self, qid: Qid, iounit: u32) {
        self.respond(Fcall::Rcreate { qid, iounit });
    }

    pub fn respond_read(&self, data: Vec<u8>) {
        self.respond(Fcall::Rread { data: Data(data) });
    }

    pub fn respond_write(&self, count: u32) {
        self.respond(Fcall::Rwrite { count });
    }

    pub fn respond_clunk(&self) {
        self.respond(Fcall::Rclunk);
    }

    pub fn respond_remove(&self) {
        self.respond(Fcall::Rremove);
    }

    pub fn respond_stat(&self, stat: Stat) {
        self.respond(Fcall::Rstat { stat });
    }

    pub fn respond_wstat(&self) {
        self.respond(Fcall::Rwstat);
    }

    /// The default dispatch pipeline: preamble fid lookup, per-kind
    /// preflight, capability invocation. Public so a [`ReqProcessOps`]
    /// hook can delegate to it.
    pub async fn process(self: &Arc<Self>) {
        {
            let mut status = self.status.lock().unwrap();
            // a flush (or a session restart) may have claimed the request
            // before any task picked it up
            if status.intersects(ReqStatus::FLUSH | ReqStatus::RESPONDED) {
                return;
            }
            status.insert(ReqStatus::WORK);
        }

        self.execute().await;

        let mut status = self.status.lock().unwrap();
        if !status.contains(ReqStatus::RESPONDED) {
            // the capability kept the request to respond later
            status.insert(ReqStatus::SAVED);
        }
        status.remove(ReqStatus::WORK);
    }

    async fn execute(self: &Arc<Self>) {
        let ops = self.conn.ops.clone();

        // preamble: messages operating on a fid must name a live one
        if let Some(fidno) = self.tc.fid() {
            match self.conn.fid_get(fidno) {
                Some(fid) => *self.fid.lock().unwrap() = Some(fid),
                None => {
                    self.respond_error(&Error::unknown_fid());
                    return;
                }
            }
        }

        match self.tc {
            Fcall::Tversion { .. } => self.version(),
            Fcall::Tauth { .. } => self.auth(&*ops).await,
            Fcall::Tattach { .. } => self.attach(&*ops).await,
            Fcall::Tflush { .. } => self.flush(&*ops).await,
            Fcall::Twalk { .. } => self.walk(&*ops).await,
            Fcall::Topen { .. } => self.open(&*ops).await,
            Fcall::Tcreate { .. } => self.create(&*ops).await,
            Fcall::Tread { .. } => self.read(&*ops).await,
            Fcall::Twrite { .. } => self.write(&*ops).await,
            Fcall::Tclunk { .. } => self.clunk(&*ops).await,
            Fcall::Tremove { .. } => ops.remove(self).await,
            Fcall::Tstat { .. } => ops.stat(self).await,
            // wstat validation is left to the capability
            Fcall::Twstat { .. } => ops.wstat(self).await,
            _ => self.respond_error(&Error::proto("invalid message", Errno::EINVAL)),
        }
    }

    fn version(&self) {
        let (msize, version) = match self.tc {
            Fcall::Tversion { msize, ref version } => (msize, version),
            _ => return,
        };

        if msize < IOHDRSZ {
            self.respond_error(&Error::proto(estr::EMSIZE, Errno::EINVAL));
            return;
        }

        let conn = &self.conn;
        if msize < conn.msize() {
            conn.msize.store(msize, Ordering::SeqCst);
        }

        let dotu = version == P92000U && conn.dotu_allowed;
        conn.dotu.store(dotu, Ordering::SeqCst);
        let ver = if dotu { P92000U } else { P92000 };

        // the session restarts: make sure the responses of all current
        // requests will be ignored
        {
            let reqs = conn.reqs.lock().unwrap();
            for (tag, r) in reqs.iter() {
                if *tag == NOTAG {
                    continue;
                }
                r.status.lock().unwrap().insert(ReqStatus::FLUSH);
            }
        }

        self.respond(Fcall::Rversion {
            msize: conn.msize(),
            version: ver.to_owned(),
        });
    }

    async fn auth(self: &Arc<Self>, ops: &Fs) {
        let (afid_no, uname, aname, n_uname) = match self.tc {
            Fcall::Tauth {
                afid,
                ref uname,
                ref aname,
                n_uname,
            } => (afid, uname, aname, n_uname),
            _ => return,
        };
        let conn = &self.conn;

        if afid_no == NOFID {
            self.respond_error(&Error::unknown_fid());
            return;
        }

        let afid = match conn.fid_new(afid_no) {
            Some(afid) => afid,
            None => {
                self.respond_error(&Error::in_use());
                return;
            }
        };
        *self.afid.lock().unwrap() = Some(afid.clone());

        let user = match conn.lookup_user(uname, n_uname) {
            Some(user) => user,
            None => {
                self.respond_error(&Error::no_user());
                return;
            }
        };

        afid.set_user(user);
        afid.set_type(QidType::AUTH);

        match ops.auth_ops() {
            Some(aop) => match aop.auth_init(&afid, aname).await {
                Ok(mut aqid) => {
                    aqid.typ |= QidType::AUTH; // just in case
                    self.respond(Fcall::Rauth { aqid });
                }
                Err(e) => self.respond_error(&e),
            },
            None => self.respond_error(&Error::no_auth()),
        }
    }

    async fn attach(self: &Arc<Self>, ops: &Fs) {
        let (fid_no, afid_no, uname, aname, n_uname) = match self.tc {
            Fcall::Tattach {
                fid,
                afid,
                ref uname,
                ref aname,
                n_uname,
            } => (fid, afid, uname, aname, n_uname),
            _ => return,
        };
        let conn = &self.conn;

        if fid_no == NOFID {
            self.respond_error(&Error::unknown_fid());
            return;
        }

        let fid = match conn.fid_new(fid_no) {
            Some(fid) => fid,
            None => {
                self.respond_error(&Error::in_use());
                return;
            }
        };
        *self.fid.lock().unwrap() = Some(fid.clone());

        if afid_no != NOFID {
            match conn.fid_get(afid_no) {
                Some(afid) => *self.afid.lock().unwrap() = Some(afid),
                None => {
                    self.respond_error(&Error::unknown_fid());
                    return;
                }
            }
        }

        let user = match conn.lookup_user(uname, n_uname) {
            Some(user) => user,
            None => {
                self.respond_error(&Error::no_user());
                return;
            }
        };
        fid.set_user(user);

        if let Some(aop) = ops.auth_ops() {
            let afid = self.afid();
            if let Err(e) = aop.auth_check(&fid, afid.as_ref(), aname).await {
                self.respond_error(&e);
                return;
            }
        }

        ops.attach(self).await;
    }

    async fn flush(self: &Arc<Self>, ops: &Fs) {
        let oldtag = match self.tc {
            Fcall::Tflush { oldtag } => oldtag,
            _ => return,
        };

        let target = {
            let reqs = self.conn.reqs.lock().unwrap();
            reqs.get(&oldtag).cloned()
        };

        let r = match target {
            // no request with that tag; it already completed
            None => {
                self.respond(Fcall::Rflush);
                return;
            }
            Some(r) => r,
        };

        if Arc::ptr_eq(&r, self) {
            // a flush naming its own tag cannot wait for itself
            self.respond(Fcall::Rflush);
            return;
        }

        r.flushreq.lock().unwrap().push(self.clone());

        let unstarted = {
            let mut status = r.status.lock().unwrap();
            let unstarted = !status.intersects(ReqStatus::WORK | ReqStatus::SAVED);
            if unstarted {
                status.insert(ReqStatus::FLUSH);
            }
            unstarted
        };

        if unstarted {
            // not picked up for dispatch yet: suppress it here, which also
            // answers every flush chained on it (including this one)
            r.respond(Fcall::Rflush);
        } else if let Some(op) = ops.flush_op() {
            op.flush(&r).await;
        }
    }

    async fn walk(self: &Arc<Self>, ops: &Fs) {
        let (fid_no, newfid_no, wnames) = match self.tc {
            Fcall::Twalk {
                fid,
                newfid,
                ref wnames,
            } => (fid, newfid, wnames),
            _ => return,
        };

        let fid = match self.fid() {
            Some(fid) => fid,
            None => return,
        };

        // walking names needs a directory; anything can be cloned
        if !wnames.is_empty() && !fid.qid_type().contains(QidType::DIR) {
            self.respond_error(&Error::not_dir());
            return;
        }

        if fid.is_opened() {
            self.respond_error(&Error::bad_use());
            return;
        }

        if fid_no != newfid_no {
            let newfid = match self.conn.fid_new(newfid_no) {
                Some(newfid) => newfid,
                None => {
                    self.respond_error(&Error::in_use());
                    return;
                }
            };

            if let Some(user) = fid.user() {
                newfid.set_user(user);
            }
            newfid.set_type(fid.qid_type());
            *self.newfid.lock().unwrap() = Some(newfid);
        } else {
            fid.inc_ref();
            *self.newfid.lock().unwrap() = Some(fid);
        }

        ops.walk(self).await;
    }

    async fn open(self: &Arc<Self>, ops: &Fs) {
        let mode = match self.tc {
            Fcall::Topen { mode, .. } => mode,
            _ => return,
        };

        let fid = match self.fid() {
            Some(fid) => fid,
            None => return,
        };

        if fid.is_opened() {
            self.respond_error(&Error::already_open());
            return;
        }

        // directories only open for reading
        if fid.qid_type().contains(QidType::DIR) && mode != om::READ {
            self.respond_error(&Error::perm());
            return;
        }

        fid.set_omode(mode);
        ops.open(self).await;
    }

    async fn create(self: &Arc<Self>, ops: &Fs) {
        let (perm, mode) = match self.tc {
            Fcall::Tcreate { perm, mode, .. } => (perm, mode),
            _ => return,
        };

        let fid = match self.fid() {
            Some(fid) => fid,
            None => return,
        };

        if fid.is_opened() {
            self.respond_error(&Error::already_open());
            return;
        }

        if !fid.qid_type().contains(QidType::DIR) {
            self.respond_error(&Error::not_dir());
            return;
        }

        // can't open directories for other than reading
        if perm & dm::DIR != 0 && mode != om::READ {
            self.respond_error(&Error::perm());
            return;
        }

        // can't create special files if not 9P2000.u
        const SPECIAL: u32 = dm::NAMEDPIPE | dm::SYMLINK | dm::LINK | dm::DEVICE | dm::SOCKET;
        if perm & SPECIAL != 0 && !self.conn.dotu() {
            self.respond_error(&Error::perm());
            return;
        }

        fid.set_omode(mode);
        ops.create(self).await;
    }

    async fn read(self: &Arc<Self>, ops: &Fs) {
        let (offset, count) = match self.tc {
            Fcall::Tread { offset, count, .. } => (offset, count),
            _ => return,
        };

        if count.saturating_add(IOHDRSZ) > self.conn.msize() {
            self.respond_error(&Error::too_large());
            return;
        }

        let fid = match self.fid() {
            Some(fid) => fid,
            None => return,
        };

        if fid.qid_type().contains(QidType::AUTH) {
            match ops.auth_ops() {
                Some(aop) => match aop.auth_read(&fid, offset, count).await {
                    Ok(mut data) => {
                        data.truncate(count as usize);
                        self.respond_read(data);
                    }
                    Err(e) => self.respond_error(&e),
                },
                None => self.respond_error(&Error::not_impl()),
            }
            return;
        }

        if fid.qid_type().contains(QidType::DIR) {
            if offset == 0 {
                fid.reset_diroffset();
            } else if offset != fid.diroffset() {
                self.respond_error(&Error::bad_offset());
                return;
            }
        }

        ops.read(self).await;
    }

    async fn write(self: &Arc<Self>, ops: &Fs) {
        let (offset, count) = match self.tc {
            Fcall::Twrite {
                offset, ref data, ..
            } => (offset, data.0.len() as u32),
            _ => return,
        };

        let fid = match self.fid() {
            Some(fid) => fid,
            None => return,
        };

        if fid.qid_type().contains(QidType::AUTH) {
            let data = match self.tc {
                Fcall::Twrite { ref data, .. } => &data.0,
                _ => return,
            };
            match ops.auth_ops() {
                Some(aop) => match aop.auth_write(&fid, offset, data).await {
                    Ok(n) => self.respond_write(n),
                    Err(e) => self.respond_error(&e),
                },
                None => self.respond_error(&Error::not_impl()),
            }
            return;
        }

        if !fid.is_opened()
            || fid.qid_type().contains(QidType::DIR)
            || (fid.omode() & 3) == om::READ
        {
            self.respond_error(&Error::bad_use());
            return;
        }

        if count.saturating_add(IOHDRSZ) > self.conn.msize() {
            self.respond_error(&Error::too_large());
            return;
        }

        ops.write(self).await;
    }

    async fn clunk(self: &Arc<Self>, ops: &Fs) {
        let fid = match self.fid() {
            Some(fid) => fid,
            None => return,
        };

        if fid.qid_type().contains(QidType::AUTH) {
            match ops.auth_ops() {
                Some(aop) => {
                    aop.auth_destroy(&fid).await;
                    self.respond_clunk();
                }
                None => self.respond_error(&Error::not_impl()),
            }
            return;
        }

        ops.clunk(self).await;
    }

    /// Deliver the response: record it, run the fid bookkeeping, put the
    /// frame on the wire (unless the request was flushed) and answer every
    /// flush waiting on this request.
    fn respond(&self, rc: Fcall) {
        let flushed = {
            let mut status = self.status.lock().unwrap();
            if status.contains(ReqStatus::RESPONDED) {
                error!("{}: duplicate response on tag {}", self.conn.id, self.tag);
                return;
            }
            let flushed = status.contains(ReqStatus::FLUSH);
            status.insert(ReqStatus::RESPONDED);
            status.remove(ReqStatus::WORK);
            flushed
        };

        self.conn.reqs.lock().unwrap().remove(&self.tag);

        let msg = Msg {
            tag: self.tag,
            body: rc,
        };
        if !flushed {
            self.postflight(&msg.body);
            self.conn.send_msg(&msg);
        }
        *self.rc.lock().unwrap() = Some(msg.body);

        // release the request's references on its fids
        for slot in [&self.fid, &self.afid, &self.newfid] {
            if let Some(fid) = slot.lock().unwrap().take() {
                self.conn.dec_ref(&fid);
            }
        }

        // answer everyone flushing this request
        let chain = std::mem::take(&mut *self.flushreq.lock().unwrap());
        for freq in chain {
            freq.respond(Fcall::Rflush);
        }
    }

    /// Per-kind bookkeeping after a successful (and unflushed) response.
    fn postflight(&self, rc: &Fcall) {
        match self.tc {
            Fcall::Tauth { .. } => {
                if let Fcall::Rauth { .. } = *rc {
                    if let Some(afid) = self.afid() {
                        afid.inc_ref();
                    }
                }
            }
            Fcall::Tattach { .. } => {
                if let Fcall::Rattach { qid } = *rc {
                    if let Some(fid) = self.fid() {
                        fid.set_type(qid.typ);
                        fid.inc_ref();
                    }
                }
            }
            Fcall::Twalk { ref wnames, .. } => {
                if let Fcall::Rwalk { ref wqids } = *rc {
                    let (fid, newfid) = match (self.fid(), self.newfid()) {
                        (Some(fid), Some(newfid)) => (fid, newfid),
                        _ => return,
                    };

                    match wqids.last() {
                        Some(q) => newfid.set_type(q.typ),
                        None => newfid.set_type(fid.qid_type()),
                    }

                    // don't retain the fid if only a partial walk succeeded
                    if wqids.len() != wnames.len() {
                        return;
                    }

                    if newfid.fid != fid.fid {
                        newfid.inc_ref();
                    }
                }
            }
            Fcall::Topen { .. } => {
                if let Some(fid) = self.fid() {
                    fid.set_opened(matches!(*rc, Fcall::Ropen { .. }));
                }
            }
            Fcall::Tcreate { .. } => {
                if let Fcall::Rcreate { qid, .. } = *rc {
                    if let Some(fid) = self.fid() {
                        fid.set_type(qid.typ);
                        fid.set_opened(true);
                    }
                }
            }
            Fcall::Tread { .. } => {
                if let Fcall::Rread { ref data } = *rc {
                    if let Some(fid) = self.fid() {
                        if fid.qid_type().contains(QidType::DIR) {
                            fid.add_diroffset(data.0.len() as u64);
                        }
                    }
                }
            }
            Fcall::Tclunk { .. } => {
                if let Fcall::Rclunk = *rc {
                    if let Some(fid) = self.fid() {
                        self.conn.dec_ref(&fid);
                    }
                }
            }
            Fcall::Tremove { .. } => {
                // the fid is released whether or not the remove succeeded
                if let Some(fid) = self.fid() {
                    self.conn.dec_ref(&fid);
                }
            }
            _ => {}
        }
    }
}

impl<Fs: ReqOps> Conn<Fs> {
    /// Resolve the wire identity the way 9P2000.u prescribes: the numeric
    /// id wins when present (or when speaking dotu), the name otherwise.
    fn lookup_user(&self, uname: &str, n_uname: u32) -> Option<Arc<dyn User>> {
        if n_uname != NOUID || self.dotu() {
            self.upool.uid2user(n_uname)
        } else if !uname.is_empty() {
            self.upool.uname2user(uname)
        } else {
            None
        }
    }
}

/// A 9P server: the backing capability plus the connection defaults.
pub struct Srv<Fs: ReqOps> {
    ops: Arc<Fs>,
    upool: Arc<dyn Users>,
    msize: u32,
    dotu: bool,
}

impl<Fs: ReqOps> Srv<Fs> {
    /// A server over `ops`, speaking up to the default msize and willing to
    /// speak 9P2000.u, resolving users against the OS passwd database.
    pub fn new(ops: Fs) -> Srv<Fs> {
        Srv {
            ops: Arc::new(ops),
            upool: Arc::new(crate::user::OsUsers),
            msize: DEFAULT_MSIZE,
            dotu: true,
        }
    }

    /// Replace the user pool.
    pub fn users(mut self, upool: Arc<dyn Users>) -> Self {
        self.upool = upool;
        self
    }

    /// Cap the maximum message size offered in version negotiation.
    pub fn msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    /// Control whether 9P2000.u may be negotiated.
    pub fn dotu(mut self, dotu: bool) -> Self {
        self.dotu = dotu;
        self
    }

    /// Run one connection over an arbitrary transport to completion.
    pub async fn serve_conn<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = self.make_conn(writer, "9p".to_owned());
        conn.read_loop(reader).await
    }

    /// Wire up per-connection state and the writer task.
    fn make_conn<W>(&self, writer: W, id: String) -> Arc<Conn<Fs>>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (wchan, mut win) = mpsc::unbounded_channel::<Bytes>();

        let conn = Arc::new(Conn {
            id,
            ops: self.ops.clone(),
            upool: self.upool.clone(),
            dotu_allowed: self.dotu,
            msize: AtomicU32::new(self.msize),
            dotu: AtomicBool::new(self.dotu),
            fids: Mutex::new(HashMap::new()),
            reqs: Mutex::new(HashMap::new()),
            wchan,
        });

        let wid = conn.id.clone();
        tokio::spawn(async move {
            let mut framed = LengthDelimitedCodec::builder()
                .length_field_offset(0)
                .length_field_length(4)
                .length_adjustment(-4)
                .little_endian()
                .new_write(writer);

            while let Some(buf) = win.recv().await {
                if let Err(e) = framed.send(buf).await {
                    error!("{}: write: {}", wid, e);
                    break;
                }
            }
        });

        conn
    }
}

async fn srv_async_tcp<Fs>(srv: Arc<Srv<Fs>>, addr: &str) -> Result<()>
where
    Fs: ReqOps,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let srv = srv.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let conn = srv.make_conn(writehalf, format!("{:?}", peer));
            if let Err(e) = conn.read_loop(readhalf).await {
                error!("connection error: {}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

pub async fn srv_async_unix<Fs>(srv: Arc<Srv<Fs>>, path: impl AsRef<Path>) -> Result<()>
where
    Fs: ReqOps,
{
    let listener = DeleteOnDrop::bind(path)?;

    loop {
        let (stream, peer) = listener.listener.accept().await?;
        info!("accepted: {:?}", peer);

        let srv = srv.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = tokio::io::split(stream);
            let conn = srv.make_conn(writehalf, format!("{:?}", peer));
            if let Err(e) = conn.read_loop(readhalf).await {
                error!("connection error: {}", e);
            }
        });
    }
}

/// Listen on a `proto!addr!port` address and serve every accepted
/// connection with the given server.
pub async fn srv_async<Fs>(srv: Srv<Fs>, addr: &str) -> Result<()>
where
    Fs: ReqOps,
{
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    let srv = Arc::new(srv);
    match proto {
        "tcp" => srv_async_tcp(srv, &listen_addr).await,
        "unix" => srv_async_unix(srv, &listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clnt::Clnt;
    use crate::user::{AnyUsers, SimpleUser};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{duplex, split};
    use tokio::time::{sleep, timeout};

    const MOTD: &[u8] = b"hello from synth\n";
    const GLENDA: &[u8] = b"space glenda\n";

    #[derive(Clone, Copy)]
    struct Node {
        qid: Qid,
        dir: bool,
    }

    fn qid(dir: bool, path: u64) -> Qid {
        Qid {
            typ: if dir { QidType::DIR } else { QidType::FILE },
            version: 0,
            path,
        }
    }

    fn lookup(path: &str) -> Option<Node> {
        let node = |dir, p| Some(Node { qid: qid(dir, p), dir });
        match path {
            "" => node(true, 1),
            "motd" => node(false, 2),
            "wr" => node(false, 3),
            "slow" => node(false, 4),
            "lib" => node(true, 5),
            "lib/glenda" => node(false, 6),
            _ => None,
        }
    }

    fn children(path: &str) -> &'static [&'static str] {
        match path {
            "" => &["motd", "wr", "slow", "lib"],
            "lib" => &["glenda"],
            _ => &[],
        }
    }

    fn content(path: &str) -> &'static [u8] {
        match path {
            "motd" => MOTD,
            "lib/glenda" => GLENDA,
            _ => b"",
        }
    }

    fn join(base: &str, name: &str) -> String {
        if base.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", base, name)
        }
    }

    fn stat_of(path: &str) -> Stat {
        let node = lookup(path).unwrap();
        let name = if path.is_empty() {
            "/".to_owned()
        } else {
            path.rsplit('/').next().unwrap().to_owned()
        };

        Stat {
            qid: node.qid,
            mode: if node.dir { dm::DIR | 0o755 } else { 0o644 },
            length: content(path).len() as u64,
            name,
            uid: "synth".to_owned(),
            gid: "synth".to_owned(),
            muid: "synth".to_owned(),
            ..Stat::default()
        }
    }

    #[derive(Default)]
    struct SynthAux {
        path: Mutex<String>,
        dirpos: Mutex<usize>,
    }

    /// In-memory filesystem driving the engine in tests. The "slow" file
    /// parks reads (the capability saves the request and responds later,
    /// from a flush or from the test itself).
    #[derive(Default)]
    struct SynthFs {
        auth: bool,
        wr: Mutex<Vec<u8>>,
        saved: Mutex<Option<Arc<Req<SynthFs>>>>,
        destroyed: AtomicUsize,
        auths_destroyed: AtomicUsize,
    }

    impl SynthFs {
        fn complete_saved(&self) {
            if let Some(r) = self.saved.lock().unwrap().take() {
                r.respond_read(b"late".to_vec());
            }
        }
    }

    #[async_trait]
    impl ReqOps for SynthFs {
        type Aux = SynthAux;

        async fn attach(&self, req: &Arc<Req<Self>>) {
            let fid = match req.fid() {
                Some(fid) => fid,
                None => return,
            };
            *fid.aux.path.lock().unwrap() = String::new();
            req.respond_attach(qid(true, 1));
        }

        async fn walk(&self, req: &Arc<Req<Self>>) {
            let (fid, newfid) = match (req.fid(), req.newfid()) {
                (Some(fid), Some(newfid)) => (fid, newfid),
                _ => return,
            };
            let wnames = match req.tc() {
                Fcall::Twalk { ref wnames, .. } => wnames,
                _ => return,
            };

            let mut path = fid.aux.path.lock().unwrap().clone();
            let mut wqids = Vec::new();
            for (i, name) in wnames.iter().enumerate() {
                let next = join(&path, name);
                match lookup(&next) {
                    Some(node) => {
                        wqids.push(node.qid);
                        path = next;
                    }
                    None => {
                        if i == 0 {
                            req.respond_error(&Error::proto("file not found", Errno::ENOENT));
                            return;
                        }
                        break;
                    }
                }
            }

            *newfid.aux.path.lock().unwrap() = path;
            req.respond_walk(wqids);
        }

        async fn open(&self, req: &Arc<Req<Self>>) {
            let fid = match req.fid() {
                Some(fid) => fid,
                None => return,
            };
            let path = fid.aux.path.lock().unwrap().clone();
            match lookup(&path) {
                Some(node) => req.respond_open(node.qid, 0),
                None => req.respond_error(&Error::proto("file not found", Errno::ENOENT)),
            }
        }

        async fn create(&self, req: &Arc<Req<Self>>) {
            req.respond_create(qid(false, 99), 0);
        }

        async fn read(&self, req: &Arc<Req<Self>>) {
            let fid = match req.fid() {
                Some(fid) => fid,
                None => return,
            };
            let (offset, count) = match *req.tc() {
                Fcall::Tread { offset, count, .. } => (offset, count),
                _ => return,
            };

            let path = fid.aux.path.lock().unwrap().clone();
            if path == "slow" {
                *self.saved.lock().unwrap() = Some(req.clone());
                return;
            }

            let node = match lookup(&path) {
                Some(node) => node,
                None => {
                    req.respond_error(&Error::proto("file not found", Errno::ENOENT));
                    return;
                }
            };

            if node.dir {
                if offset == 0 {
                    *fid.aux.dirpos.lock().unwrap() = 0;
                }

                let names = children(&path);
                let mut pos = fid.aux.dirpos.lock().unwrap();
                let mut buf = Vec::new();
                while *pos < names.len() {
                    let st = stat_of(&join(&path, names[*pos]));
                    let mut rec = Vec::new();
                    serialize::write_stat(&mut rec, &st, req.conn().dotu()).unwrap();
                    if buf.len() + rec.len() > count as usize {
                        break;
                    }
                    buf.extend_from_slice(&rec);
                    *pos += 1;
                }
                req.respond_read(buf);
                return;
            }

            let bytes: Vec<u8> = match path.as_str() {
                "wr" => self.wr.lock().unwrap().clone(),
                p => content(p).to_vec(),
            };
            let off = offset as usize;
            let data = if off >= bytes.len() {
                Vec::new()
            } else {
                bytes[off..bytes.len().min(off + count as usize)].to_vec()
            };
            req.respond_read(data);
        }

        async fn write(&self, req: &Arc<Req<Self>>) {
            let data = match *req.tc() {
                Fcall::Twrite { ref data, .. } => &data.0,
                _ => return,
            };
            self.wr.lock().unwrap().extend_from_slice(data);
            req.respond_write(data.len() as u32);
        }

        async fn clunk(&self, req: &Arc<Req<Self>>) {
            req.respond_clunk();
        }

        async fn remove(&self, req: &Arc<Req<Self>>) {
            req.respond_remove();
        }

        async fn stat(&self, req: &Arc<Req<Self>>) {
            let fid = match req.fid() {
                Some(fid) => fid,
                None => return,
            };
            let path = fid.aux.path.lock().unwrap().clone();
            req.respond_stat(stat_of(&path));
        }

        async fn wstat(&self, req: &Arc<Req<Self>>) {
            req.respond_wstat();
        }

        fn auth_ops(&self) -> Option<&dyn AuthOps<SynthAux>> {
            if self.auth { Some(self) } else { None }
        }

        fn flush_op(&self) -> Option<&dyn FlushOp<Self>> {
            Some(self)
        }

        fn fid_destroy_op(&self) -> Option<&dyn FidDestroyOp<SynthAux>> {
            Some(self)
        }
    }

    #[async_trait]
    impl AuthOps<SynthAux> for SynthFs {
        async fn auth_init(&self, _afid: &Arc<Fid<SynthAux>>, _aname: &str) -> Result<Qid> {
            Ok(Qid {
                typ: QidType::AUTH,
                version: 0,
                path: 1000,
            })
        }

        async fn auth_check(
            &self,
            _fid: &Arc<Fid<SynthAux>>,
            _afid: Option<&Arc<Fid<SynthAux>>>,
            _aname: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn auth_read(
            &self,
            _afid: &Arc<Fid<SynthAux>>,
            _offset: u64,
            _count: u32,
        ) -> Result<Vec<u8>> {
            Ok(b"proof".to_vec())
        }

        async fn auth_write(
            &self,
            _afid: &Arc<Fid<SynthAux>>,
            _offset: u64,
            data: &[u8],
        ) -> Result<u32> {
            Ok(data.len() as u32)
        }

        async fn auth_destroy(&self, _afid: &Arc<Fid<SynthAux>>) {
            self.auths_destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FlushOp<SynthFs> for SynthFs {
        async fn flush(&self, _req: &Arc<Req<SynthFs>>) {
            self.complete_saved();
        }
    }

    impl FidDestroyOp<SynthAux> for SynthFs {
        fn fid_destroy(&self, _fid: &Fid<SynthAux>) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        clnt: Arc<Clnt>,
        conn: Arc<Conn<SynthFs>>,
        fs: Arc<SynthFs>,
        root: crate::clnt::Fid,
        user: Arc<dyn User>,
    }

    async fn setup(fs: SynthFs) -> Harness {
        let (cend, send) = duplex(1 << 20);
        let (cr, cw) = split(cend);
        let (sr, sw) = split(send);

        let srv = Srv::new(fs).users(Arc::new(AnyUsers));
        let fs = srv.ops.clone();
        let conn = srv.make_conn(sw, "test".to_owned());
        tokio::spawn(conn.clone().read_loop(sr));

        let clnt = Clnt::connect(cr, cw, DEFAULT_MSIZE, true).await.unwrap();
        let user: Arc<dyn User> = Arc::new(SimpleUser::new("glenda", 1001));
        let root = clnt.attach(None, &user, "").await.unwrap();

        Harness {
            clnt,
            conn,
            fs,
            root,
            user,
        }
    }

    /// Give the engine a moment to finish post-response bookkeeping.
    async fn settle() {
        sleep(Duration::from_millis(20)).await;
    }

    async fn wait_saved(fs: &SynthFs) {
        for _ in 0..200 {
            if fs.saved.lock().unwrap().is_some() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("request never reached the capability");
    }

    fn proto_ename<T: std::fmt::Debug>(result: crate::utils::Result<T>) -> String {
        match result {
            Err(Error::Proto { ename, .. }) => ename,
            Ok(v) => panic!("expected protocol error, got {:?}", v),
            Err(e) => panic!("expected protocol error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn version_negotiate() {
        let h = setup(SynthFs::default()).await;
        assert_eq!(h.clnt.msize(), DEFAULT_MSIZE);
        assert!(h.clnt.dotu());
        assert_eq!(h.conn.msize(), DEFAULT_MSIZE);
        assert!(h.conn.dotu());
    }

    #[tokio::test]
    async fn version_rejects_tiny_msize() {
        let (cend, send) = duplex(1 << 20);
        let (cr, cw) = split(cend);
        let (sr, sw) = split(send);

        let srv = Srv::new(SynthFs::default()).users(Arc::new(AnyUsers));
        let conn = srv.make_conn(sw, "test".to_owned());
        tokio::spawn(conn.read_loop(sr));

        match Clnt::connect(cr, cw, 8, true).await {
            Err(Error::Proto { ename, .. }) => assert_eq!(ename, estr::EMSIZE),
            other => panic!("expected msize error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn attach_creates_fid_with_refcount_one() {
        let h = setup(SynthFs::default()).await;
        settle().await;

        let fids = h.conn.fids.lock().unwrap();
        assert_eq!(fids.len(), 1);
        assert_eq!(fids.get(&h.root.fid).unwrap().refcount(), 1);
        assert!(fids.get(&h.root.fid).unwrap().qid_type().contains(QidType::DIR));
    }

    #[tokio::test]
    async fn clone_walk_retains_newfid() {
        let h = setup(SynthFs::default()).await;

        let f = h.clnt.walk(&h.root, &[]).await.unwrap();
        assert_eq!(f.qid, h.root.qid);
        settle().await;

        let fids = h.conn.fids.lock().unwrap();
        assert_eq!(fids.len(), 2);
        assert_eq!(fids.get(&f.fid).unwrap().refcount(), 1);
    }

    #[tokio::test]
    async fn short_walk_does_not_retain_newfid() {
        let h = setup(SynthFs::default()).await;

        let rc = h
            .clnt
            .rpc(Fcall::Twalk {
                fid: h.root.fid,
                newfid: 77,
                wnames: vec!["lib".to_owned(), "missing".to_owned(), "deeper".to_owned()],
            })
            .await
            .unwrap();

        match rc {
            Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
            other => panic!("unexpected reply: {:?}", other),
        }

        settle().await;
        assert!(!h.conn.fids.lock().unwrap().contains_key(&77));
        assert!(h.fs.destroyed.load(Ordering::SeqCst) >= 1);

        // the client-level verb reports a partial walk as ENOENT
        let err = h
            .clnt
            .walk(&h.root, &["lib", "missing"])
            .await
            .map(|_| ());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn walk_on_open_fid_rejected() {
        let h = setup(SynthFs::default()).await;

        let mut dir = h.clnt.walk(&h.root, &[]).await.unwrap();
        h.clnt.open(&mut dir, om::READ).await.unwrap();

        let err = h
            .clnt
            .rpc(Fcall::Twalk {
                fid: dir.fid,
                newfid: 50,
                wnames: vec!["motd".to_owned()],
            })
            .await;
        assert_eq!(proto_ename(err), estr::EBADUSE);
    }

    #[tokio::test]
    async fn directory_read_offset_discipline() {
        let h = setup(SynthFs::default()).await;

        let mut dir = h.clnt.walk(&h.root, &[]).await.unwrap();
        h.clnt.open(&mut dir, om::READ).await.unwrap();

        // a small count forces the listing over several reads
        let first = h.clnt.read(&dir, 0, 128).await.unwrap();
        assert!(!first.is_empty());

        // neither 0 nor the running offset
        let err = h.clnt.read(&dir, 3, 128).await;
        assert_eq!(proto_ename(err), estr::EBADOFFSET);

        // continuing at the running offset drains the directory
        let mut total = first.len();
        let mut chunks = vec![first];
        loop {
            let next = h.clnt.read(&dir, total as u64, 128).await.unwrap();
            if next.is_empty() {
                break;
            }
            total += next.len();
            chunks.push(next);
        }

        let all: Vec<u8> = chunks.concat();
        let mut cur = Cursor::new(&all[..]);
        let mut names = Vec::new();
        while (cur.position() as usize) < all.len() {
            names.push(serialize::read_stat(&mut cur, true).unwrap().name);
        }
        assert_eq!(names, vec!["motd", "wr", "slow", "lib"]);

        // offset 0 resets the listing
        let again = h.clnt.read(&dir, 0, 4096).await.unwrap();
        assert_eq!(again, all);
    }

    #[tokio::test]
    async fn oversize_read_skips_capability() {
        let h = setup(SynthFs::default()).await;

        let mut f = h.clnt.walk(&h.root, &["slow"]).await.unwrap();
        h.clnt.open(&mut f, om::READ).await.unwrap();

        let err = h
            .clnt
            .rpc(Fcall::Tread {
                fid: f.fid,
                offset: 0,
                count: h.clnt.msize() - IOHDRSZ + 1,
            })
            .await;
        assert_eq!(proto_ename(err), estr::ETOOLARGE);
        assert!(h.fs.saved.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn write_requires_open_for_writing() {
        let h = setup(SynthFs::default()).await;

        let f = h.clnt.walk(&h.root, &["wr"]).await.unwrap();
        let err = h.clnt.write(&f, 0, b"data").await;
        assert_eq!(proto_ename(err), estr::EBADUSE);
        h.clnt.clunk(f).await.unwrap();

        let mut f = h.clnt.walk(&h.root, &["wr"]).await.unwrap();
        h.clnt.open(&mut f, om::READ).await.unwrap();
        let err = h.clnt.write(&f, 0, b"data").await;
        assert_eq!(proto_ename(err), estr::EBADUSE);
        h.clnt.clunk(f).await.unwrap();

        let mut f = h.clnt.walk(&h.root, &["wr"]).await.unwrap();
        h.clnt.open(&mut f, om::WRITE).await.unwrap();
        let n = h.clnt.write(&f, 0, b"data").await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&*h.fs.wr.lock().unwrap(), b"data");
    }

    #[tokio::test]
    async fn open_rules() {
        let h = setup(SynthFs::default()).await;

        // double open
        let mut f = h.clnt.walk(&h.root, &["motd"]).await.unwrap();
        h.clnt.open(&mut f, om::READ).await.unwrap();
        let err = h.clnt.rpc(Fcall::Topen {
            fid: f.fid,
            mode: om::READ,
        });
        assert_eq!(proto_ename(err.await), estr::EOPEN);

        // directories only open read-only
        let dir = h.clnt.walk(&h.root, &["lib"]).await.unwrap();
        let err = h
            .clnt
            .rpc(Fcall::Topen {
                fid: dir.fid,
                mode: om::WRITE,
            })
            .await;
        assert_eq!(proto_ename(err), estr::EPERM);
    }

    #[tokio::test]
    async fn unknown_fid_rejected() {
        let h = setup(SynthFs::default()).await;

        let err = h
            .clnt
            .rpc(Fcall::Topen {
                fid: 999,
                mode: om::READ,
            })
            .await;
        assert_eq!(proto_ename(err), estr::EUNKNOWNFID);
    }

    #[tokio::test]
    async fn flush_of_completed_tag_answers_immediately() {
        let h = setup(SynthFs::default()).await;

        let rc = h.clnt.rpc(Fcall::Tflush { oldtag: 12345 }).await.unwrap();
        assert_eq!(rc, Fcall::Rflush);
    }

    #[tokio::test]
    async fn flush_nudges_saved_request() {
        let h = setup(SynthFs::default()).await;

        let mut f = h.clnt.walk(&h.root, &["slow"]).await.unwrap();
        h.clnt.open(&mut f, om::READ).await.unwrap();

        let req = h
            .clnt
            .rpc_nb(Fcall::Tread {
                fid: f.fid,
                offset: 0,
                count: 64,
            })
            .unwrap();
        wait_saved(&h.fs).await;

        let rc = h
            .clnt
            .rpc(Fcall::Tflush {
                oldtag: req.tag(),
            })
            .await
            .unwrap();
        assert_eq!(rc, Fcall::Rflush);

        // the target was nudged to completion; its reply is delivered
        let rc = h.clnt.rpc_done(req).await.unwrap();
        assert_eq!(
            rc,
            Fcall::Rread {
                data: Data(b"late".to_vec())
            }
        );
    }

    #[tokio::test]
    async fn version_restart_suppresses_stale_response() {
        let h = setup(SynthFs::default()).await;

        let mut f = h.clnt.walk(&h.root, &["slow"]).await.unwrap();
        h.clnt.open(&mut f, om::READ).await.unwrap();

        let req = h
            .clnt
            .rpc_nb(Fcall::Tread {
                fid: f.fid,
                offset: 0,
                count: 64,
            })
            .unwrap();
        wait_saved(&h.fs).await;

        // a new Tversion logically restarts the session
        let rc = h
            .clnt
            .rpc(Fcall::Tversion {
                msize: DEFAULT_MSIZE,
                version: P92000U.to_owned(),
            })
            .await
            .unwrap();
        assert!(matches!(rc, Fcall::Rversion { .. }));

        // the stale request responds, but nothing reaches the wire
        h.fs.complete_saved();
        assert!(
            timeout(Duration::from_millis(100), h.clnt.rpc_done(req))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn clean_teardown_leaves_empty_fid_table() {
        let h = setup(SynthFs::default()).await;

        let a = h.clnt.walk(&h.root, &["lib"]).await.unwrap();
        let b = h.clnt.walk(&h.root, &["lib", "glenda"]).await.unwrap();

        h.clnt.clunk(a).await.unwrap();
        h.clnt.clunk(b).await.unwrap();
        h.clnt.clunk(h.root).await.unwrap();
        settle().await;

        assert!(h.conn.fids.lock().unwrap().is_empty());
        assert_eq!(h.fs.destroyed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn remove_releases_fid() {
        let h = setup(SynthFs::default()).await;

        let f = h.clnt.walk(&h.root, &["motd"]).await.unwrap();
        let fidno = f.fid;
        h.clnt.remove(f).await.unwrap();
        settle().await;

        assert!(!h.conn.fids.lock().unwrap().contains_key(&fidno));
    }

    #[tokio::test]
    async fn stat_and_wstat() {
        let h = setup(SynthFs::default()).await;

        let st = h.clnt.stat(&h.root).await.unwrap();
        assert_eq!(st.name, "/");
        assert!(st.mode & dm::DIR != 0);

        let f = h.clnt.walk(&h.root, &["motd"]).await.unwrap();
        let st = h.clnt.stat(&f).await.unwrap();
        assert_eq!(st.name, "motd");
        assert_eq!(st.length, MOTD.len() as u64);

        h.clnt.wstat(&f, &st).await.unwrap();
    }

    #[tokio::test]
    async fn auth_fid_routes_to_auth_ops() {
        let h = setup(SynthFs {
            auth: true,
            ..SynthFs::default()
        })
        .await;

        let afid = h.clnt.auth(&h.user, "").await.unwrap();
        assert!(afid.qid.typ.contains(QidType::AUTH));

        // reads and writes on the auth fid never reach ReqOps
        let data = h.clnt.read(&afid, 0, 64).await.unwrap();
        assert_eq!(data, b"proof");
        let n = h.clnt.write(&afid, 0, b"creds").await.unwrap();
        assert_eq!(n, 5);

        let root2 = h.clnt.attach(Some(&afid), &h.user, "").await.unwrap();
        assert!(root2.qid.typ.contains(QidType::DIR));

        h.clnt.clunk(afid).await.unwrap();
        settle().await;
        assert_eq!(h.fs.auths_destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_without_auth_ops_rejected() {
        let h = setup(SynthFs::default()).await;

        match h.clnt.auth(&h.user, "").await {
            Err(Error::Proto { ename, .. }) => assert_eq!(ename, estr::ENOAUTH),
            other => panic!("expected auth rejection, got {:?}", other.map(|_| ())),
        }
    }

    type RawReader =
        tokio_util::codec::FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>;
    type RawWriter =
        tokio_util::codec::FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>;

    async fn send_raw(writer: &mut RawWriter, msg: &Msg) {
        let mut buf = Vec::new();
        serialize::write_msg(&mut buf, msg, false).unwrap();
        writer.send(Bytes::from(buf)).await.unwrap();
    }

    async fn recv_raw(reader: &mut RawReader) -> Msg {
        let bytes = reader.next().await.unwrap().unwrap();
        serialize::read_msg(&mut bytes.reader(), false).unwrap()
    }

    #[tokio::test]
    async fn duplicate_live_tag_rejected() {
        let (cend, send) = duplex(1 << 20);
        let (cr, cw) = split(cend);
        let (sr, sw) = split(send);

        let srv = Srv::new(SynthFs::default())
            .users(Arc::new(AnyUsers))
            .dotu(false);
        let conn = srv.make_conn(sw, "test".to_owned());
        tokio::spawn(conn.read_loop(sr));

        let mut reader = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_read(cr);
        let mut writer = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(cw);

        send_raw(
            &mut writer,
            &Msg {
                tag: 1,
                body: Fcall::Tattach {
                    fid: 0,
                    afid: NOFID,
                    uname: "glenda".to_owned(),
                    aname: String::new(),
                    n_uname: NOUID,
                },
            },
        )
        .await;
        assert!(matches!(recv_raw(&mut reader).await.body, Fcall::Rattach { .. }));

        send_raw(
            &mut writer,
            &Msg {
                tag: 2,
                body: Fcall::Twalk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["slow".to_owned()],
                },
            },
        )
        .await;
        assert!(matches!(recv_raw(&mut reader).await.body, Fcall::Rwalk { .. }));

        send_raw(
            &mut writer,
            &Msg {
                tag: 3,
                body: Fcall::Topen {
                    fid: 1,
                    mode: om::READ,
                },
            },
        )
        .await;
        assert!(matches!(recv_raw(&mut reader).await.body, Fcall::Ropen { .. }));

        // first read parks in the capability; reusing its tag is an error
        send_raw(
            &mut writer,
            &Msg {
                tag: 9,
                body: Fcall::Tread {
                    fid: 1,
                    offset: 0,
                    count: 16,
                },
            },
        )
        .await;
        send_raw(
            &mut writer,
            &Msg {
                tag: 9,
                body: Fcall::Tread {
                    fid: 1,
                    offset: 0,
                    count: 16,
                },
            },
        )
        .await;

        let reply = recv_raw(&mut reader).await;
        assert_eq!(reply.tag, 9);
        match reply.body {
            Fcall::Rerror { ename, .. } => assert_eq!(ename, estr::EINUSE),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
