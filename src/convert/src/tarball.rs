//! Archive primitives: transparent gzip detection and the epoch-timestamped
//! tar headers every synthesised ACI entry uses.

use std::fs::File;
use std::io::{self, BufWriter, Chain, Cursor, Read, Write};
use std::path::Path;

use docker2aci_core::config::Compression;
use docker2aci_core::error::{ConvertError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Gzip member magic plus the deflate compression method byte.
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// How many bytes the detection helper peeks.
const PEEK_LEN: usize = 10;

/// A byte stream with any gzip wrapping stripped.
pub enum DecompressedReader<R: Read> {
    Plain(Chain<Cursor<Vec<u8>>, R>),
    Gzip(GzDecoder<Chain<Cursor<Vec<u8>>, R>>),
}

impl<R: Read> Read for DecompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
        }
    }
}

/// Peek the first bytes of `reader` and chain a gzip decoder when the
/// stream starts with the gzip magic. A gzip header with a compression
/// method other than deflate is rejected as a malformed layer.
pub fn decompressed<R: Read>(mut reader: R) -> Result<DecompressedReader<R>> {
    let mut peeked = [0u8; PEEK_LEN];
    let mut filled = 0;
    while filled < PEEK_LEN {
        match reader.read(&mut peeked[filled..])? {
            0 => break,
            n => filled += n,
        }
    }

    let head = Cursor::new(peeked[..filled].to_vec()).chain(reader);
    if filled >= 3 && peeked[..3] == GZIP_MAGIC {
        Ok(DecompressedReader::Gzip(GzDecoder::new(head)))
    } else if filled >= 3 && peeked[..2] == GZIP_MAGIC[..2] {
        Err(ConvertError::BadLayerFormat(format!(
            "gzip stream with unsupported compression method {:#04x}",
            peeked[2]
        )))
    } else {
        Ok(DecompressedReader::Plain(head))
    }
}

/// Sink for a produced ACI: a file with optional gzip wrapping. Closing
/// happens in tar → gzip → file order via [`AciWriter::finish`].
pub enum AciWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl AciWriter {
    pub fn create(path: &Path, compression: Compression) -> Result<Self> {
        let file = File::create(path)?;
        Ok(match compression {
            Compression::Gzip => Self::Gzip(GzEncoder::new(
                BufWriter::new(file),
                flate2::Compression::default(),
            )),
            Compression::None => Self::Plain(BufWriter::new(file)),
        })
    }

    pub fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Gzip(w) => w.finish()?.flush(),
        }
    }
}

impl Write for AciWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}

/// A tar header with the fixed identity fields every generated entry
/// carries: uid/gid 0, uname/gname "0", mtime at the Unix epoch.
pub fn epoch_header() -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    // Field widths fit "0"; ignore the impossible error paths.
    let _ = header.set_username("0");
    let _ = header.set_groupname("0");
    header
}

/// Header for the leading `rootfs/` directory entry.
pub fn rootfs_dir_header() -> tar::Header {
    let mut header = epoch_header();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    header
}

/// Header for the trailing `manifest` entry.
pub fn manifest_header(size: u64) -> tar::Header {
    let mut header = epoch_header();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(size);
    header
}
