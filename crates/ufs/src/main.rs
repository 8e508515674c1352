use {
    async_trait::async_trait,
    clap::Parser,
    ninep::{
        error::Error,
        fcall::*,
        io_err, res, serialize,
        srv::{self, Fid, FidDestroyOp, Req, ReqOps, Srv},
    },
    std::{io::SeekFrom, os::unix::fs::PermissionsExt, path::PathBuf, sync::Arc},
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::{Mutex, RwLock},
    },
};

mod utils;
use crate::utils::*;

// 9P wstat carries "don't touch" sentinels (all bits set) for every field
// the client is not changing; only the remaining fields are applied.
const DONT_TOUCH_U32: u32 = !0;
const DONT_TOUCH_U64: u64 = !0;

/// Directory listings are packed stat records. The whole listing is packed
/// when a read at offset 0 arrives and then served a whole record at a time;
/// the engine's diroffset bookkeeping guarantees continuation reads line up.
#[derive(Default)]
struct DirState {
    entries: Vec<Vec<u8>>,
    pos: usize,
}

#[derive(Default)]
struct UfsAux {
    realpath: RwLock<PathBuf>,
    file: Mutex<Option<fs::File>>,
    dirents: Mutex<DirState>,
}

struct Ufs {
    realroot: PathBuf,
}

impl Ufs {
    async fn do_attach(&self, fid: &Arc<Fid<UfsAux>>) -> ninep::Result<Qid> {
        {
            let mut realpath = fid.aux.realpath.write().await;
            *realpath = self.realroot.clone();
        }

        get_qid(&self.realroot).await
    }

    async fn do_walk(
        &self,
        fid: &Arc<Fid<UfsAux>>,
        newfid: &Arc<Fid<UfsAux>>,
        wnames: &[String],
    ) -> ninep::Result<Vec<Qid>> {
        let mut path = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };

        let mut wqids = Vec::new();
        for (i, name) in wnames.iter().enumerate() {
            path.push(name);

            let qid = match get_qid(&path).await {
                Ok(qid) => qid,
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    }
                    path.pop();
                    break;
                }
            };

            wqids.push(qid);
        }

        {
            let mut realpath = newfid.aux.realpath.write().await;
            *realpath = path;
        }

        Ok(wqids)
    }

    async fn do_open(&self, fid: &Arc<Fid<UfsAux>>) -> ninep::Result<Qid> {
        let realpath = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };

        let qid = get_qid(&realpath).await?;
        if !qid.typ.contains(QidType::DIR) {
            let omode = fid.omode();
            let mut opts = fs::OpenOptions::new();
            match omode & 3 {
                om::WRITE => opts.write(true),
                om::RDWR => opts.read(true).write(true),
                _ => opts.read(true),
            };
            if omode & om::TRUNC != 0 {
                opts.write(true).truncate(true);
            }

            let file = opts.open(&realpath).await?;
            *fid.aux.file.lock().await = Some(file);
        }

        Ok(qid)
    }

    async fn do_create(
        &self,
        fid: &Arc<Fid<UfsAux>>,
        name: &str,
        perm: u32,
        mode: u8,
        ext: &str,
    ) -> ninep::Result<Qid> {
        let path = {
            let realpath = fid.aux.realpath.read().await;
            realpath.join(name)
        };

        if perm & dm::DIR != 0 {
            fs::DirBuilder::new()
                .mode(perm & 0o777)
                .create(&path)
                .await?;
        } else if perm & dm::SYMLINK != 0 {
            fs::symlink(ext, &path).await?;
        } else if perm & (dm::DEVICE | dm::NAMEDPIPE | dm::SOCKET) != 0 {
            return Err(Error::not_impl());
        } else {
            let mut opts = fs::OpenOptions::new();
            match mode & 3 {
                om::WRITE => opts.write(true),
                om::RDWR => opts.read(true).write(true),
                _ => opts.read(true),
            };
            let file = opts
                .create_new(true)
                .mode(perm & 0o777)
                .open(&path)
                .await?;
            *fid.aux.file.lock().await = Some(file);
        }

        let qid = get_qid(&path).await?;
        {
            let mut realpath = fid.aux.realpath.write().await;
            *realpath = path;
        }

        Ok(qid)
    }

    async fn do_read_dir(
        &self,
        fid: &Arc<Fid<UfsAux>>,
        offset: u64,
        count: u32,
        dotu: bool,
    ) -> ninep::Result<Vec<u8>> {
        let mut state = fid.aux.dirents.lock().await;

        if offset == 0 {
            let realpath = {
                let realpath = fid.aux.realpath.read().await;
                realpath.clone()
            };

            state.entries.clear();
            state.pos = 0;

            let mut dir = fs::read_dir(&realpath).await?;
            while let Some(entry) = dir.next_entry().await? {
                let attr = fs::symlink_metadata(entry.path()).await?;
                let mut st = stat_from_attr(&attr, &entry.file_name().to_string_lossy());
                if dotu && attr.file_type().is_symlink() {
                    if let Ok(target) = fs::read_link(entry.path()).await {
                        st.ext = target.to_string_lossy().into_owned();
                    }
                }

                let mut rec = Vec::new();
                serialize::write_stat(&mut rec, &st, dotu)?;
                state.entries.push(rec);
            }
        }

        let mut buf = Vec::new();
        while state.pos < state.entries.len() {
            let rec = &state.entries[state.pos];
            if buf.len() + rec.len() > count as usize {
                break;
            }
            buf.extend_from_slice(rec);
            state.pos += 1;
        }

        Ok(buf)
    }

    async fn do_read_file(
        &self,
        fid: &Arc<Fid<UfsAux>>,
        offset: u64,
        count: u32,
    ) -> ninep::Result<Vec<u8>> {
        let mut file = fid.aux.file.lock().await;
        let file = file.as_mut().ok_or_else(|| Error::bad_use())?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0; count as usize];
        let bytes = file.read(&mut buf[..]).await?;
        buf.truncate(bytes);
        Ok(buf)
    }

    async fn do_write(
        &self,
        fid: &Arc<Fid<UfsAux>>,
        offset: u64,
        data: &[u8],
    ) -> ninep::Result<u32> {
        let mut file = fid.aux.file.lock().await;
        let file = file.as_mut().ok_or_else(|| Error::bad_use())?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.write(data).await? as u32)
    }

    async fn do_remove(&self, fid: &Arc<Fid<UfsAux>>) -> ninep::Result<()> {
        let path = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };

        match fs::symlink_metadata(&path).await? {
            ref attr if attr.is_dir() => fs::remove_dir(&path).await?,
            _ => fs::remove_file(&path).await?,
        };

        Ok(())
    }

    async fn do_stat(&self, fid: &Arc<Fid<UfsAux>>, dotu: bool) -> ninep::Result<Stat> {
        let path = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };

        let attr = fs::symlink_metadata(&path).await?;
        let name = path
            .file_name()
            .map_or_else(|| "/".to_owned(), |n| n.to_string_lossy().into_owned());

        let mut st = stat_from_attr(&attr, &name);
        if dotu && attr.file_type().is_symlink() {
            if let Ok(target) = fs::read_link(&path).await {
                st.ext = target.to_string_lossy().into_owned();
            }
        }

        Ok(st)
    }

    async fn do_wstat(&self, fid: &Arc<Fid<UfsAux>>, stat: &Stat) -> ninep::Result<()> {
        let path = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };

        if stat.mode != DONT_TOUCH_U32 {
            fs::set_permissions(&path, std::fs::Permissions::from_mode(stat.mode & 0o777)).await?;
        }

        if stat.length != DONT_TOUCH_U64 {
            fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await?
                .set_len(stat.length)
                .await?;
        }

        if stat.mtime != DONT_TOUCH_U32 {
            let path = path.clone();
            let mtime = filetime::FileTime::from_unix_time(i64::from(stat.mtime), 0);
            tokio::task::spawn_blocking(move || filetime::set_file_mtime(path, mtime))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        }

        // a rename stays within the containing directory
        if !stat.name.is_empty() {
            let newpath = path.with_file_name(&stat.name);
            if newpath != path {
                fs::rename(&path, &newpath).await?;
                let mut realpath = fid.aux.realpath.write().await;
                *realpath = newpath;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ReqOps for Ufs {
    type Aux = UfsAux;

    async fn attach(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        match self.do_attach(&fid).await {
            Ok(qid) => req.respond_attach(qid),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn walk(&self, req: &Arc<Req<Self>>) {
        let (Some(fid), Some(newfid)) = (req.fid(), req.newfid()) else {
            return;
        };
        let Fcall::Twalk { ref wnames, .. } = *req.tc() else {
            return;
        };

        match self.do_walk(&fid, &newfid, wnames).await {
            Ok(wqids) => req.respond_walk(wqids),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn open(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        match self.do_open(&fid).await {
            Ok(qid) => req.respond_open(qid, 0),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn create(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        let Fcall::Tcreate {
            ref name,
            perm,
            mode,
            ref ext,
            ..
        } = *req.tc()
        else {
            return;
        };

        match self.do_create(&fid, name, perm, mode, ext).await {
            Ok(qid) => req.respond_create(qid, 0),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn read(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        let Fcall::Tread { offset, count, .. } = *req.tc() else {
            return;
        };

        let result = if fid.qid_type().contains(QidType::DIR) {
            self.do_read_dir(&fid, offset, count, req.conn().dotu()).await
        } else {
            self.do_read_file(&fid, offset, count).await
        };

        match result {
            Ok(data) => req.respond_read(data),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn write(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        let Fcall::Twrite {
            offset, ref data, ..
        } = *req.tc()
        else {
            return;
        };

        match self.do_write(&fid, offset, &data.0).await {
            Ok(count) => req.respond_write(count),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn clunk(&self, req: &Arc<Req<Self>>) {
        req.respond_clunk();
    }

    async fn remove(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        match self.do_remove(&fid).await {
            Ok(()) => req.respond_remove(),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn stat(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        match self.do_stat(&fid, req.conn().dotu()).await {
            Ok(stat) => req.respond_stat(stat),
            Err(e) => req.respond_error(&e),
        }
    }

    async fn wstat(&self, req: &Arc<Req<Self>>) {
        let Some(fid) = req.fid() else { return };
        let Fcall::Twstat { ref stat, .. } = *req.tc() else {
            return;
        };

        match self.do_wstat(&fid, stat).await {
            Ok(()) => req.respond_wstat(),
            Err(e) => req.respond_error(&e),
        }
    }

    fn fid_destroy_op(&self) -> Option<&dyn FidDestroyOp<UfsAux>> {
        Some(self)
    }
}

impl FidDestroyOp<UfsAux> for Ufs {
    fn fid_destroy(&self, fid: &Fid<UfsAux>) {
        // drop the backing handle as soon as the fid is gone
        if let Ok(mut file) = fid.aux.file.try_lock() {
            *file = None;
        }
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Refuse to negotiate the 9P2000.u dialect
    #[arg(long)]
    no_dotu: bool,
}

async fn ufs_main(
    Cli {
        address,
        exportdir,
        no_dotu,
    }: Cli,
) -> ninep::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export path must be a directory"));
    }

    println!("[*] Exporting: {}", exportdir.display());
    println!("[*] Ready to accept clients: {}", address);
    srv::srv_async(
        Srv::new(Ufs {
            realroot: exportdir,
        })
        .dotu(!no_dotu),
        &address,
    )
    .await
    .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ufs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ufs-test-{}-{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn qid_reflects_file_type() {
        let dir = scratch("qid-dir");
        let _ = std::fs::create_dir(&dir);
        let file = dir.join("f");
        std::fs::write(&file, b"contents").unwrap();

        let dq = get_qid(&dir).await.unwrap();
        assert!(dq.typ.contains(QidType::DIR));

        let fq = get_qid(&file).await.unwrap();
        assert!(!fq.typ.contains(QidType::DIR));
        assert_ne!(dq.path, fq.path);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stat_carries_mode_and_length() {
        let dir = scratch("stat");
        let _ = std::fs::create_dir(&dir);
        let file = dir.join("f");
        std::fs::write(&file, b"0123456789").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();

        let attr = std::fs::symlink_metadata(&file).unwrap();
        let st = stat_from_attr(&attr, "f");
        assert_eq!(st.name, "f");
        assert_eq!(st.length, 10);
        assert_eq!(st.mode & 0o777, 0o640);
        assert_eq!(st.mode & dm::DIR, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
