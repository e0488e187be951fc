//! Copy and move files between storage backends - `fscp`
//!
//! `fscp` moves files and directory trees between heterogeneous backends: hierarchical
//! filesystems and flat "prefix" stores that only know object keys. Every backend implements
//! [`backend::FileShare`]; the [`copy::Engine`] picks the strategy for each request:
//!
//! - **Within one backend** the backend's own copy is used. Prefix stores copy key by key after
//!   rebuilding the directory hierarchy from a listing.
//! - **Between backends** the source is encoded as a tar archive and streamed through a
//!   flow-controlled stream into the destination, one entry at a time, so that no file is ever
//!   held in memory as a whole.
//!
//! ## Copy Semantics
//!
//! Destination paths resolve like `rsync`:
//!
//! - `fscp -r A/B C/D` → creates `C/D/B` if `C/D` is an existing directory, `C/D` otherwise
//! - `fscp -r A/B/ C/D` → copies the contents of `A/B` into `C/D`
//!
//! An existing destination is never replaced silently: use `--overwrite` to delete it first or
//! `--merge` to copy a directory into an existing one.
//!
//! # Examples
//!
//! ```bash
//! # Copy a directory, printing a summary
//! fscp -r /data/photos /backup/ --summary
//!
//! # Move a single file
//! fscp --move /data/report.pdf /archive/2024/
//!
//! # Force the streaming path even within one filesystem, with a small window
//! fscp -r --stream --window 64KiB /src /dst
//! ```

pub mod backend;
pub mod connection;
pub mod copy;
pub mod localfs;
pub mod memstore;

pub use backend::FileShare;
pub use connection::{Connection, FileCopyOpts, FileInfo};
pub use copy::{Engine, Summary};
