//! Lazy columns.
//!
//! A mine that can derive an expensive value from one of its files stores a
//! [`LazyLocator`] in the column instead of the value. Whenever a query reads
//! that column, the engine hands the locator to the decoder registered for
//! its tag, which reaches the owning engine through the identity registry
//! and computes the value.
//!
//! Locators are plain blobs carrying a fixed prefix, so they survive in any
//! column regardless of its declared type. Encoding is deterministic: the
//! same locator always produces the same bytes, which keeps
//! insert-or-ignore re-indexing idempotent.

use crate::engine::Engine;
use crate::error::{ErrorKind, Result};
use crate::identity::Registry;
use crate::models::{CacheIdentity, FileId, FileRecord};
use crate::value::Value;
use exn::{OptionExt, ResultExt};
use facet_json::{from_str as from_json, to_string as to_json};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::trace;

/// Every encoded locator starts with these bytes.
const MAGIC: &[u8] = b"\0lode:lazy:";

#[derive(facet::Facet)]
struct LocatorProxy {
    #[facet(rename = "t")]
    tag: String,
    #[facet(rename = "f")]
    file: i64,
    #[facet(rename = "c")]
    cache: String,
    #[facet(rename = "a")]
    attribute: String,
}

/// Reference to a value derived from one file, resolved on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyLocator {
    /// Selects the decoder.
    pub tag: String,
    pub file: FileId,
    /// Identity of the index that owns `file`.
    pub cache: CacheIdentity,
    /// Mine-defined key naming which derived value of `file` this is.
    pub attribute: String,
}
impl LazyLocator {
    pub fn new(tag: impl Into<String>, file: FileId, cache: CacheIdentity, attribute: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            file,
            cache,
            attribute: attribute.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let proxy = LocatorProxy {
            tag: self.tag.clone(),
            file: self.file.get(),
            cache: self.cache.as_str().to_string(),
            attribute: self.attribute.clone(),
        };
        let json = to_json(&proxy).or_raise(|| ErrorKind::InvalidData("lazy locator"))?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + json.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(json.as_bytes());
        Ok(bytes)
    }

    /// Whether `bytes` claim to be a locator at all.
    pub fn is_locator(bytes: &[u8]) -> bool {
        bytes.starts_with(MAGIC)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let json = bytes
            .strip_prefix(MAGIC)
            .ok_or_raise(|| ErrorKind::InvalidData("lazy locator"))?;
        let json = std::str::from_utf8(json).or_raise(|| ErrorKind::InvalidData("lazy locator"))?;
        let proxy = from_json::<LocatorProxy>(json).or_raise(|| ErrorKind::InvalidData("lazy locator"))?;
        Ok(Self {
            tag: proxy.tag,
            file: FileId::new(proxy.file),
            cache: CacheIdentity::from(proxy.cache),
            attribute: proxy.attribute,
        })
    }
}

/// Computes the value of a lazy column from the owning engine, the file the
/// locator points at and the locator's attribute key.
pub type DecodeFn = Arc<dyn Fn(Engine, FileRecord, String) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

static GLOBAL: LazyLock<Arc<Decoders>> = LazyLock::new(|| Arc::new(Decoders::new()));

/// Table of decoders by locator tag.
#[derive(Default)]
pub struct Decoders {
    table: RwLock<HashMap<String, DecodeFn>>,
}
impl Decoders {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table shared by every engine that isn't given its own.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Associate `tag` with `decode`. Registering a tag that already has a
    /// decoder keeps the existing one and returns `false`.
    pub fn register<F, Fut>(&self, tag: &str, decode: F) -> bool
    where
        F: Fn(Engine, FileRecord, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.contains_key(tag) {
            return false;
        }
        let decode: DecodeFn = Arc::new(move |engine, file, attribute| Box::pin(decode(engine, file, attribute)));
        table.insert(tag.to_string(), decode);
        true
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.table.read().unwrap_or_else(PoisonError::into_inner).contains_key(tag)
    }

    fn get(&self, tag: &str) -> Option<DecodeFn> {
        self.table.read().unwrap_or_else(PoisonError::into_inner).get(tag).cloned()
    }
}

/// Resolve `locator` to its value.
///
/// Fails with [`ErrorKind::UnknownDecoder`] when nothing handles the tag,
/// and with [`ErrorKind::OwningCacheNotOpen`] when no engine for the owning
/// index is open in `registry`.
pub async fn decode(registry: &Registry, decoders: &Decoders, locator: &LazyLocator) -> Result<Value> {
    let decoder = decoders
        .get(&locator.tag)
        .ok_or_raise(|| ErrorKind::UnknownDecoder(locator.tag.clone()))?;
    let engine = registry.resolve(&locator.cache)?;
    let file = engine
        .file(locator.file)
        .await?
        .ok_or_raise(|| ErrorKind::FileNotFound(locator.file))?;
    trace!(tag = %locator.tag, file = %locator.file, attribute = %locator.attribute, "decoding lazy value");
    decoder(engine, file, locator.attribute.clone()).await
}
