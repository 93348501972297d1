//! Transparent decompression of opened files.

use crate::error::{ErrorKind, Result};
use bzip2::read::BzDecoder;
use derive_more::Display;
use exn::ResultExt;
use flate2::read::GzDecoder;
use lode_index::Stream;
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::instrument;

const BZIP2_MAGIC: [u8; 3] = [0x42, 0x5A, 0x68];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// A compression format recognised when opening files in text mode.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    #[display("none")]
    None,
    #[display("bzip2")]
    Bzip2,
    #[display("gzip")]
    Gzip,
}
impl Compression {
    fn from_magic_bytes(bytes: &[u8]) -> Self {
        if bytes.starts_with(&BZIP2_MAGIC) {
            Compression::Bzip2
        } else if bytes.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    /// Peek at the start of `reader`, leaving its position where it was.
    pub fn sniff<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<Self> {
        let start = reader.stream_position().or_raise(|| ErrorKind::InvalidData)?;
        let mut magic = [0u8; BZIP2_MAGIC.len()];
        let mut filled = 0;
        while filled < magic.len() {
            match reader.read(&mut magic[filled..]).or_raise(|| ErrorKind::InvalidData)? {
                0 => break,
                n => filled += n,
            }
        }
        reader.seek(SeekFrom::Start(start)).or_raise(|| ErrorKind::InvalidData)?;
        Ok(Compression::from_magic_bytes(&magic[..filled]))
    }

    /// Inflate everything `reader` yields, in memory.
    #[instrument(skip(reader), fields(format = %self, output_size))]
    pub fn decompress<R: Read>(&self, mut reader: R) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        match self {
            Compression::None => reader.read_to_end(&mut output),
            Compression::Bzip2 => BzDecoder::new(reader).read_to_end(&mut output),
            Compression::Gzip => GzDecoder::new(reader).read_to_end(&mut output),
        }
        .or_raise(|| ErrorKind::InvalidData)?;
        tracing::Span::current().record("output_size", output.len());
        Ok(output)
    }
}

/// Replace a compressed stream with a seekable view of its content.
/// Uncompressed streams are returned untouched.
pub fn decompressed(mut stream: Stream) -> Result<Stream> {
    match Compression::sniff(&mut stream)? {
        Compression::None => Ok(stream),
        compression => Ok(Box::new(Cursor::new(compression.decompress(stream)?))),
    }
}
