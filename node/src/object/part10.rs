//! Bounded header scan of Part-10 style object files.

use super::{ObjectHeader, ObjectReader};
use crate::archive::transfer_syntax;
use crate::model::{attr, Attributes};
use eyre::{Result, WrapErr};
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const DEFAULT_HEADER_READ_BYTES: usize = 64 * 1024;

type Tag = (u16, u16);

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const META_GROUP: u16 = 0x0002;
const TRANSFER_SYNTAX_UID: Tag = (0x0002, 0x0010);
const MEDIA_STORAGE_SOP_CLASS_UID: Tag = (0x0002, 0x0002);
const MEDIA_STORAGE_SOP_INSTANCE_UID: Tag = (0x0002, 0x0003);
const PIXEL_DATA: Tag = (0x7FE0, 0x0010);
const ITEM: Tag = (0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = (0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = (0xFFFE, 0xE0DD);
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const MAX_NESTING: u8 = 16;

/// VRs with a reserved field and 32-bit length in explicit encodings.
const LONG_VRS: &[&[u8; 2]] = &[
    b"OB", b"OD", b"OF", b"OL", b"OV", b"OW", b"SQ", b"SV", b"UC", b"UN", b"UR", b"UT", b"UV",
];

/// Data set attributes extracted from the scanned header, in tag order.
pub(crate) const HEADER_TAGS: &[(Tag, &str)] = &[
    ((0x0008, 0x0016), attr::SOP_CLASS_UID),
    ((0x0008, 0x0018), attr::SOP_INSTANCE_UID),
    ((0x0008, 0x0060), attr::MODALITY),
    ((0x0010, 0x0010), attr::PATIENT_NAME),
    ((0x0010, 0x0020), attr::PATIENT_ID),
    ((0x0020, 0x000D), attr::STUDY_INSTANCE_UID),
    ((0x0020, 0x000E), attr::SERIES_INSTANCE_UID),
];

const LAST_HEADER_TAG: Tag = (0x0020, 0x000E);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    ImplicitLittle,
    ExplicitLittle,
    ExplicitBig,
}

impl Encoding {
    /// `None` for encodings that cannot be scanned in place (deflated).
    fn for_transfer_syntax(uid: &str) -> Option<Self> {
        match uid {
            transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN => Some(Encoding::ImplicitLittle),
            transfer_syntax::EXPLICIT_VR_BIG_ENDIAN => Some(Encoding::ExplicitBig),
            transfer_syntax::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN => None,
            _ => Some(Encoding::ExplicitLittle),
        }
    }

    fn is_explicit(self) -> bool {
        !matches!(self, Encoding::ImplicitLittle)
    }
}

#[derive(Debug, Clone, Copy)]
struct ElementHeader {
    tag: Tag,
    length: u32,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    encoding: Encoding,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize, encoding: Encoding) -> Self {
        Self { buf, pos, encoding }
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        let raw: [u8; 2] = self.bytes(2)?.try_into().ok()?;
        Some(match self.encoding {
            Encoding::ExplicitBig => u16::from_be_bytes(raw),
            _ => u16::from_le_bytes(raw),
        })
    }

    fn u32(&mut self) -> Option<u32> {
        let raw: [u8; 4] = self.bytes(4)?.try_into().ok()?;
        Some(match self.encoding {
            Encoding::ExplicitBig => u32::from_be_bytes(raw),
            _ => u32::from_le_bytes(raw),
        })
    }

    fn peek_group(&self) -> Option<u16> {
        let raw: [u8; 2] = self.buf.get(self.pos..self.pos + 2)?.try_into().ok()?;
        Some(match self.encoding {
            Encoding::ExplicitBig => u16::from_be_bytes(raw),
            _ => u16::from_le_bytes(raw),
        })
    }

    fn header(&mut self) -> Option<ElementHeader> {
        let tag = (self.u16()?, self.u16()?);
        // Items and delimiters never carry a VR.
        if tag.0 == 0xFFFE || !self.encoding.is_explicit() {
            let length = self.u32()?;
            return Some(ElementHeader { tag, length });
        }
        let vr: [u8; 2] = self.bytes(2)?.try_into().ok()?;
        let length = if LONG_VRS.contains(&&vr) {
            self.bytes(2)?;
            self.u32()?
        } else {
            u32::from(self.u16()?)
        };
        Some(ElementHeader { tag, length })
    }

    fn skip_undefined_sequence(&mut self, depth: u8) -> Option<()> {
        if depth > MAX_NESTING {
            return None;
        }
        loop {
            let header = self.header()?;
            match header.tag {
                SEQUENCE_DELIMITATION => return Some(()),
                ITEM if header.length == UNDEFINED_LENGTH => self.skip_undefined_item(depth + 1)?,
                ITEM => {
                    self.bytes(header.length as usize)?;
                }
                _ => return None,
            }
        }
    }

    fn skip_undefined_item(&mut self, depth: u8) -> Option<()> {
        loop {
            let header = self.header()?;
            if header.tag == ITEM_DELIMITATION {
                return Some(());
            }
            if header.length == UNDEFINED_LENGTH {
                self.skip_undefined_sequence(depth)?;
            } else {
                self.bytes(header.length as usize)?;
            }
        }
    }
}

/// Scans the meta header and leading data set elements of an object file.
#[derive(Debug, Clone)]
pub struct Part10Reader {
    max_bytes: usize,
}

impl Part10Reader {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(PREAMBLE_LEN + MAGIC.len()),
        }
    }
}

impl Default for Part10Reader {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_READ_BYTES)
    }
}

impl ObjectReader for Part10Reader {
    fn read_header(&self, path: &Path) -> Result<ObjectHeader> {
        let file = File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
        let mut buf = Vec::with_capacity(self.max_bytes.min(DEFAULT_HEADER_READ_BYTES));
        file.take(self.max_bytes as u64)
            .read_to_end(&mut buf)
            .wrap_err_with(|| format!("failed to read header of {}", path.display()))?;
        Ok(scan_header(&buf))
    }
}

fn scan_header(buf: &[u8]) -> ObjectHeader {
    let mut header = ObjectHeader::default();
    let mut media_class = None;
    let mut media_instance = None;

    let has_preamble = buf.get(PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()) == Some(MAGIC.as_slice());
    let (dataset_start, encoding) = if has_preamble {
        let mut cursor = Cursor::new(buf, PREAMBLE_LEN + MAGIC.len(), Encoding::ExplicitLittle);
        while cursor.peek_group() == Some(META_GROUP) {
            let Some(element) = cursor.header() else {
                break;
            };
            if element.length == UNDEFINED_LENGTH {
                break;
            }
            let Some(value) = cursor.bytes(element.length as usize) else {
                break;
            };
            match element.tag {
                TRANSFER_SYNTAX_UID => header.transfer_syntax = decode_text(value),
                MEDIA_STORAGE_SOP_CLASS_UID => media_class = decode_text(value),
                MEDIA_STORAGE_SOP_INSTANCE_UID => media_instance = decode_text(value),
                _ => {}
            }
        }
        let encoding = match header.transfer_syntax.as_deref() {
            Some(uid) => Encoding::for_transfer_syntax(uid),
            None => Some(Encoding::ExplicitLittle),
        };
        (cursor.pos, encoding)
    } else {
        (0, Some(detect_raw_encoding(buf)))
    };

    if let Some(encoding) = encoding {
        scan_dataset(&mut Cursor::new(buf, dataset_start, encoding), &mut header.attributes);
    }

    if let Some(class) = media_class {
        header
            .attributes
            .entry(attr::SOP_CLASS_UID.to_string())
            .or_insert(class);
    }
    if let Some(instance) = media_instance {
        header
            .attributes
            .entry(attr::SOP_INSTANCE_UID.to_string())
            .or_insert(instance);
    }
    header
}

fn scan_dataset(cursor: &mut Cursor<'_>, attributes: &mut Attributes) {
    while let Some(element) = cursor.header() {
        if element.tag == PIXEL_DATA || element.tag > LAST_HEADER_TAG {
            break;
        }
        if element.length == UNDEFINED_LENGTH {
            if cursor.skip_undefined_sequence(0).is_none() {
                break;
            }
            continue;
        }
        let Some(value) = cursor.bytes(element.length as usize) else {
            break;
        };
        let keyword = HEADER_TAGS
            .iter()
            .find(|(tag, _)| *tag == element.tag)
            .map(|(_, keyword)| *keyword);
        if let (Some(keyword), Some(text)) = (keyword, decode_text(value)) {
            attributes.insert(keyword.to_string(), text);
        }
    }
}

/// Raw data sets carry no transfer syntax; an explicit VR shows up as two
/// uppercase letters right after the first tag.
fn detect_raw_encoding(buf: &[u8]) -> Encoding {
    match buf.get(4..6) {
        Some([a, b]) if a.is_ascii_uppercase() && b.is_ascii_uppercase() => Encoding::ExplicitLittle,
        _ => Encoding::ImplicitLittle,
    }
}

fn decode_text(value: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(value);
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
