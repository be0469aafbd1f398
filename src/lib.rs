//! scubed3: a deniable encrypted block-storage engine.
//!
//! Presents one or more passphrase-unlocked logical partitions over a
//! single backing file or block device. The raw store, independent of
//! which partitions are currently open, is a uniform sea of fixed-size
//! macroblocks that are continuously rewritten in an externally
//! unpredictable order (the juggler, [`juggler`]) so that neither a
//! partition's presence, size, nor content can be shown without its key.
//!
//! Three subsystems make up the core:
//!
//! - [`macroblock`] — the on-disk macroblock format: scan, per-macroblock
//!   read/write, integrity check.
//! - [`juggler`] — the randomized rewrite schedule.
//! - [`partition`] — the logical-offset indirection layer (replay, GC,
//!   read/write path) built on the two above.
//!
//! [`registry`] ties named partitions together over one backing store,
//! and [`control`] exposes the external line protocol as pure
//! parsing/dispatch against the registry (no socket transport: that is a
//! named non-goal of this crate).

pub mod api;
pub mod bitmap;
pub mod bitpacker;
pub mod cipher;
pub mod control;
pub mod device;
pub mod error;
pub mod juggler;
pub mod keymat;
pub mod macroblock;
pub mod partition;
pub mod registry;

pub use api::Geometry;
pub use cipher::CipherSpec;
pub use error::{Error, Result};
pub use partition::Partition;
pub use registry::Registry;
