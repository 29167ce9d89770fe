//! Mime codes stored in document records
//!
//! A code packs the major class in the high half-word and a minor number in
//! the low one. Handling hints live in the top bits:
//!
//! ```text
//!  31       23        16 15              0
//! ┌────────┬──────────┬─────────────────┐
//! │ flags  │  major   │      minor      │
//! └────────┴──────────┴─────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::LazyLock;

/// Code given to zero-length files
pub const MIME_EMPTY: u32 = 1;

/// Never read the content of this type
pub const DONT_PARSE: u32 = 0x8000_0000;
pub const PDF_MASK: u32 = 0x4000_0000;
pub const FONT_MASK: u32 = 0x2000_0000;
pub const ARC_MASK: u32 = 0x1000_0000;
pub const ARC_FILTER_MASK: u32 = 0x0800_0000;
pub const DOC_MASK: u32 = 0x0400_0000;
pub const MOBI_MASK: u32 = 0x0200_0000;
pub const MARKUP_MASK: u32 = 0x0100_0000;
pub const RAW_MASK: u32 = 0x0080_0000;

const FLAGS: u32 = 0xFF80_0000;

/// Major mime class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MajorMime {
    Invalid,
    Model,
    Example,
    Message,
    Multipart,
    Font,
    Video,
    Audio,
    Image,
    Text,
    Application,
}

impl MajorMime {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => MajorMime::Model,
            2 => MajorMime::Example,
            3 => MajorMime::Message,
            4 => MajorMime::Multipart,
            5 => MajorMime::Font,
            6 => MajorMime::Video,
            7 => MajorMime::Audio,
            8 => MajorMime::Image,
            9 => MajorMime::Text,
            10 => MajorMime::Application,
            _ => MajorMime::Invalid,
        }
    }

    const fn bits(self) -> u32 {
        match self {
            MajorMime::Invalid => 0,
            MajorMime::Model => 1,
            MajorMime::Example => 2,
            MajorMime::Message => 3,
            MajorMime::Multipart => 4,
            MajorMime::Font => 5,
            MajorMime::Video => 6,
            MajorMime::Audio => 7,
            MajorMime::Image => 8,
            MajorMime::Text => 9,
            MajorMime::Application => 10,
        }
    }
}

/// Major class of a mime code
pub fn major(code: u32) -> MajorMime {
    MajorMime::from_bits((code & !FLAGS) >> 16)
}

const fn code(major: MajorMime, minor: u32, flags: u32) -> u32 {
    (major.bits() << 16) | minor | flags
}

use MajorMime::{Application as App, Audio, Font, Image, Text, Video};

/// (extension, code, mime name)
const TABLE: &[(&str, u32, &str)] = &[
    ("txt", code(Text, 1, 0), "text/plain"),
    ("log", code(Text, 1, 0), "text/plain"),
    ("md", code(Text, 2, 0), "text/markdown"),
    ("csv", code(Text, 3, 0), "text/csv"),
    ("html", code(Text, 4, MARKUP_MASK), "text/html"),
    ("htm", code(Text, 4, MARKUP_MASK), "text/html"),
    ("xml", code(Text, 5, MARKUP_MASK), "text/xml"),
    ("css", code(Text, 6, 0), "text/css"),
    ("rs", code(Text, 7, 0), "text/x-rust"),
    ("c", code(Text, 8, 0), "text/x-c"),
    ("h", code(Text, 8, 0), "text/x-c"),
    ("py", code(Text, 9, 0), "text/x-python"),
    ("sh", code(Text, 10, 0), "text/x-shellscript"),
    ("json", code(App, 1, 0), "application/json"),
    ("pdf", code(App, 2, PDF_MASK), "application/pdf"),
    ("zip", code(App, 3, ARC_MASK), "application/zip"),
    ("tar", code(App, 4, ARC_MASK), "application/x-tar"),
    ("gz", code(App, 5, ARC_FILTER_MASK), "application/gzip"),
    ("bz2", code(App, 6, ARC_FILTER_MASK), "application/x-bzip2"),
    ("xz", code(App, 7, ARC_FILTER_MASK), "application/x-xz"),
    ("docx", code(App, 8, DOC_MASK), "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xlsx", code(App, 9, DOC_MASK), "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("pptx", code(App, 10, DOC_MASK), "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("epub", code(App, 11, 0), "application/epub+zip"),
    ("mobi", code(App, 12, MOBI_MASK), "application/x-mobipocket-ebook"),
    ("iso", code(App, 13, DONT_PARSE), "application/x-iso9660-image"),
    ("so", code(App, 14, DONT_PARSE), "application/x-sharedlib"),
    ("o", code(App, 15, DONT_PARSE), "application/x-object"),
    ("png", code(Image, 1, 0), "image/png"),
    ("jpg", code(Image, 2, 0), "image/jpeg"),
    ("jpeg", code(Image, 2, 0), "image/jpeg"),
    ("gif", code(Image, 3, 0), "image/gif"),
    ("webp", code(Image, 4, 0), "image/webp"),
    ("bmp", code(Image, 5, 0), "image/bmp"),
    ("svg", code(Image, 6, MARKUP_MASK), "image/svg+xml"),
    ("nef", code(Image, 7, RAW_MASK), "image/x-nikon-nef"),
    ("cr2", code(Image, 8, RAW_MASK), "image/x-canon-cr2"),
    ("mp3", code(Audio, 1, 0), "audio/mpeg"),
    ("flac", code(Audio, 2, 0), "audio/flac"),
    ("ogg", code(Audio, 3, 0), "audio/ogg"),
    ("wav", code(Audio, 4, 0), "audio/x-wav"),
    ("mp4", code(Video, 1, 0), "video/mp4"),
    ("mkv", code(Video, 2, 0), "video/x-matroska"),
    ("webm", code(Video, 3, 0), "video/webm"),
    ("avi", code(Video, 4, 0), "video/x-msvideo"),
    ("ttf", code(Font, 1, FONT_MASK), "font/ttf"),
    ("otf", code(Font, 2, FONT_MASK), "font/otf"),
    ("woff", code(Font, 3, FONT_MASK), "font/woff"),
];

static BY_EXTENSION: LazyLock<HashMap<&'static str, u32>> =
    LazyLock::new(|| TABLE.iter().map(|&(ext, code, _)| (ext, code)).collect());

static NAMES: LazyLock<HashMap<u32, &'static str>> =
    LazyLock::new(|| TABLE.iter().map(|&(_, code, name)| (code, name)).collect());

static BY_NAME: LazyLock<HashMap<&'static str, u32>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for &(_, code, name) in TABLE {
        map.entry(name).or_insert(code);
    }
    map
});

/// Bytes of file header needed by [`mime_by_content`]
pub const SNIFF_LEN: usize = 8192;

/// Mime code for a file extension (without the dot), case-insensitive
pub fn mime_by_extension(ext: &str) -> Option<u32> {
    if ext.is_empty() {
        return None;
    }
    match BY_EXTENSION.get(ext) {
        Some(&code) => Some(code),
        None => BY_EXTENSION.get(ext.to_ascii_lowercase().as_str()).copied(),
    }
}

/// Mime code detected from magic bytes, for files whose extension is
/// missing or unknown
pub fn mime_by_content(header: &[u8]) -> Option<u32> {
    let kind = infer::get(header)?;
    BY_NAME.get(kind.mime_type()).copied()
}

/// Mime type string for a code
pub fn mime_name(code: u32) -> Option<&'static str> {
    if code == MIME_EMPTY {
        return Some("inode/x-empty");
    }
    NAMES.get(&code).copied()
}

/// Whether the content of a file with this code should be read at all
pub fn should_parse(code: u32) -> bool {
    code != 0 && code != MIME_EMPTY && code & DONT_PARSE == 0
}
