#![forbid(unsafe_code)]
//! Asynchronous 9P2000/9P2000.u client and server library for Rust.
//!
//! This crate provides tokio-based implementations of both endpoints of the
//! 9P2000 file-service protocol (and its 9P2000.u Unix extension): a client
//! engine that multiplexes concurrent RPCs over one connection, and a server
//! engine that dispatches requests against a backing capability while
//! enforcing 9P's per-fid rules.
//!
//! # Overview
//!
//! 9P was developed for the Plan 9 distributed operating system. A client
//! issues T-messages (`Tversion`, `Tattach`, `Twalk`, `Topen`, `Tread`, ...)
//! and receives matching R-messages, correlated by a 16-bit tag; files are
//! named by 32-bit fids the client chooses. 9P2000.u adds numeric uids,
//! special-file metadata and numeric errnos on `Rerror`.
//!
//! # Client
//!
//! ```no_run
//! use std::sync::Arc;
//! use ninep::{clnt, fcall::om, user::{User, SimpleUser}};
//!
//! #[tokio::main]
//! async fn main() -> ninep::Result<()> {
//!     let user: Arc<dyn User> = Arc::new(SimpleUser::new("glenda", 1001));
//!     let (clnt, root) = clnt::mount("tcp!127.0.0.1!564", "", &user).await?;
//!
//!     let mut fid = clnt.walk(&root, &["usr", "glenda", "lib", "profile"]).await?;
//!     clnt.open(&mut fid, om::READ).await?;
//!     let data = clnt.read(&fid, 0, 4096).await?;
//!     clnt.clunk(fid).await?;
//!
//!     println!("{}", String::from_utf8_lossy(&data));
//!     Ok(())
//! }
//! ```
//!
//! # Server
//!
//! Implement [`srv::ReqOps`] for your backing store (and optionally
//! [`srv::AuthOps`], [`srv::FlushOp`], [`srv::FidDestroyOp`]); each callback
//! receives the validated request and answers it with one `respond_*` call:
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use ninep::{srv::{self, ReqOps, Req, Srv}, Qid, QidType};
//!
//! struct HelloFs;
//!
//! #[async_trait]
//! impl ReqOps for HelloFs {
//!     type Aux = ();
//!
//!     async fn attach(&self, req: &Arc<Req<Self>>) {
//!         req.respond_attach(Qid {
//!             typ: QidType::DIR,
//!             version: 0,
//!             path: 0,
//!         });
//!     }
//!
//!     // ... the remaining operations ...
//!     # async fn walk(&self, req: &Arc<Req<Self>>) { req.respond_walk(vec![]) }
//!     # async fn open(&self, req: &Arc<Req<Self>>) { req.respond_error(&ninep::Error::not_impl()) }
//!     # async fn create(&self, req: &Arc<Req<Self>>) { req.respond_error(&ninep::Error::not_impl()) }
//!     # async fn read(&self, req: &Arc<Req<Self>>) { req.respond_read(vec![]) }
//!     # async fn write(&self, req: &Arc<Req<Self>>) { req.respond_write(0) }
//!     # async fn clunk(&self, req: &Arc<Req<Self>>) { req.respond_clunk() }
//!     # async fn remove(&self, req: &Arc<Req<Self>>) { req.respond_remove() }
//!     # async fn stat(&self, req: &Arc<Req<Self>>) { req.respond_error(&ninep::Error::not_impl()) }
//!     # async fn wstat(&self, req: &Arc<Req<Self>>) { req.respond_wstat() }
//! }
//!
//! #[tokio::main]
//! async fn main() -> ninep::Result<()> {
//!     srv::srv_async(Srv::new(HelloFs), "tcp!0.0.0.0!564").await
//! }
//! ```
//!
//! # Transport
//!
//! Both engines frame messages with a 4-byte little-endian length prefix and
//! run over anything `AsyncRead + AsyncWrite`; the `tcp!host!port` and
//! `unix!path` address forms are built in.
pub mod clnt;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
pub mod user;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
