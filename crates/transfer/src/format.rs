//! Signature-based recognition of ingested file formats.

use std::fmt;

/// Number of leading bytes needed to recognize any supported format.
pub const SIGNATURE_LEN: usize = 8;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";
const JPEG_SOI: &[u8] = &[0xFF, 0xD8, 0xFF];
const VHDX_IDENTIFIER: &[u8] = b"vhdxfile";

/// File formats the server knows how to take in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Png,
    Zip,
    Jpeg,
    Vhdx,
}

impl Format {
    /// Identifies the format from the first bytes of a file.
    pub fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(PNG_MAGIC) {
            Some(Format::Png)
        } else if head.starts_with(ZIP_LOCAL_HEADER) || head.starts_with(ZIP_EMPTY_ARCHIVE) {
            Some(Format::Zip)
        } else if head.starts_with(JPEG_SOI) {
            Some(Format::Jpeg)
        } else if head.starts_with(VHDX_IDENTIFIER) {
            Some(Format::Vhdx)
        } else {
            None
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Png => "png",
            Format::Zip => "zip",
            Format::Jpeg => "jpeg",
            Format::Vhdx => "vhdx",
        };
        f.write_str(name)
    }
}
