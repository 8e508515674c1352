use {
    ninep::fcall::*,
    std::{fs::Metadata, os::unix::prelude::*, path::Path},
    tokio::fs,
};

pub async fn get_qid<T: AsRef<Path> + ?Sized>(path: &T) -> ninep::Result<Qid> {
    Ok(qid_from_attr(&fs::symlink_metadata(path.as_ref()).await?))
}

pub fn qid_from_attr(attr: &Metadata) -> Qid {
    Qid {
        typ: From::from(attr.file_type()),
        version: attr.mtime() as u32,
        path: attr.ino(),
    }
}

pub fn mode_from_attr(attr: &Metadata) -> u32 {
    let mut mode = attr.mode() & 0o777;

    if attr.is_dir() {
        mode |= dm::DIR;
    }

    if attr.file_type().is_symlink() {
        mode |= dm::SYMLINK;
    }

    mode
}

pub fn uname(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map_or_else(|| uid.to_string(), |pw| pw.name)
}

pub fn gname(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map_or_else(|| gid.to_string(), |gr| gr.name)
}

pub fn stat_from_attr(attr: &Metadata, name: &str) -> Stat {
    Stat {
        qid: qid_from_attr(attr),
        mode: mode_from_attr(attr),
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        length: if attr.is_dir() { 0 } else { attr.size() },
        name: name.to_owned(),
        uid: uname(attr.uid()),
        gid: gname(attr.gid()),
        muid: String::new(),
        n_uid: attr.uid(),
        n_gid: attr.gid(),
        n_muid: NOUID,
        ..Stat::default()
    }
}
