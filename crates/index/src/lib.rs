//! Persistent dataset index with lazily materialized columns.
//!
//! An [`Engine`] owns one SQLite index. Pluggable [`Mine`]s discover files
//! (paths on disk, members of archives, records inside containers) and write
//! them to the shared `files` table, along with any derived tables of their
//! own. A derived column may hold a [`LazyLocator`] instead of a value: the
//! value is only computed when a query reads it, through the decoder the
//! mine registered for the locator's tag.
//!
//! # Architecture
//! - **Index store**: `mines` (content-addressed mine configurations) and
//!   `files` (one row per discovered item, unique per path and mine).
//! - **Identity registry**: maps the persistent identity of every open index
//!   to its engine, so locators can find the index they came from.
//! - **Resource cache**: bounded pool that keeps expensive handles (parsed
//!   archives) open across lazy lookups.
//!
//! The index is not the source of truth, the datasets are. Items that
//! disappear from disk stay in the index until it is rebuilt.

mod db;
mod engine;
pub mod error;
mod identity;
pub mod lazy;
mod mine;
mod models;
pub mod pivot;
mod query;
mod repo;
pub mod resource;
mod value;

pub use crate::engine::{Engine, EngineOptions, WeakEngine};
pub use crate::identity::Registry;
pub use crate::lazy::{Decoders, LazyLocator};
pub use crate::mine::{IndexContext, Kinds, Mine, MineKind, OpenMode, ReadSeek, Stream};
pub use crate::models::{CacheIdentity, FileId, FileRecord, MineConfig, MineId, MineRecord};
pub use crate::query::{Query, RowStream};
pub use crate::resource::{Checkout, ResourceCache};
pub use crate::value::{Row, Value};
