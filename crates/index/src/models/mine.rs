use crate::error::{Error, ErrorKind, Result};
use crate::models::MineId;
use exn::ResultExt;
use facet_json::{from_str as from_json, to_string as to_json};
use time::UtcDateTime;

#[derive(sqlx::FromRow)]
pub(crate) struct MineRow {
    pub(crate) id: i64,
    pub(crate) config: Vec<u8>,
    #[sqlx(default)]
    pub(crate) last_indexed_at: Option<i64>,
}

#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
struct ConfigProxy {
    #[facet(rename = "k")]
    kind: String,
    #[facet(rename = "v")]
    version: u32,
    #[facet(rename = "c")]
    payload: String,
}

/// Serialized configuration of one mine.
///
/// Each mine kind owns an explicit, versioned encoding of its settings (the
/// `payload`). The envelope is stored verbatim in the `mines` table, and
/// identical envelopes resolve to the same [`MineId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MineConfig {
    pub kind: String,
    pub version: u32,
    pub payload: String,
}
impl MineConfig {
    pub fn new(kind: impl Into<String>, version: u32, payload: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            version,
            payload: payload.into(),
        }
    }

    /// Encode into the bytes stored in (and deduplicated by) the index.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let proxy = ConfigProxy {
            kind: self.kind.clone(),
            version: self.version,
            payload: self.payload.clone(),
        };
        Ok(to_json(&proxy).or_raise(|| ErrorKind::InvalidData("mine config"))?.into_bytes())
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(blob).or_raise(|| ErrorKind::InvalidData("mine config"))?;
        let proxy = from_json::<ConfigProxy>(text).or_raise(|| ErrorKind::InvalidData("mine config"))?;
        Ok(Self {
            kind: proxy.kind,
            version: proxy.version,
            payload: proxy.payload,
        })
    }
}

/// A persisted mine: its identity, configuration and when it was last
/// indexed successfully (`None` until the first forced pass completes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MineRecord {
    pub id: MineId,
    pub config: MineConfig,
    pub last_indexed_at: Option<UtcDateTime>,
}
impl TryFrom<MineRow> for MineRecord {
    type Error = Error;
    fn try_from(row: MineRow) -> std::result::Result<Self, Self::Error> {
        let id = MineId::new(row.id);
        Ok(Self {
            id,
            config: MineConfig::from_blob(&row.config).or_raise(|| ErrorKind::CorruptIndex(id))?,
            last_indexed_at: row
                .last_indexed_at
                .map(|t| super::from_nanos(t).or_raise(|| ErrorKind::InvalidData("mine index time")))
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_configs_encode_identically() {
        let a = MineConfig::new("directory", 1, r#"{"root":"/data"}"#);
        let b = MineConfig::new("directory", 1, r#"{"root":"/data"}"#);
        assert_eq!(a.to_blob().unwrap(), b.to_blob().unwrap());
        let c = MineConfig::new("directory", 2, r#"{"root":"/data"}"#);
        assert_ne!(a.to_blob().unwrap(), c.to_blob().unwrap());
    }

    #[test]
    fn test_blob_decodes() {
        let config = MineConfig::new("records", 1, "{}");
        let decoded = MineConfig::from_blob(&config.to_blob().unwrap()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_garbage_row_is_corrupt() {
        let row = MineRow {
            id: 4,
            config: b"\x80pickle".to_vec(),
            last_indexed_at: None,
        };
        let err = MineRecord::try_from(row).unwrap_err();
        assert!(matches!(&*err, ErrorKind::CorruptIndex(id) if *id == MineId::new(4)));
    }
}
