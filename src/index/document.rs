//! Document records and typed meta lines

use crate::error::{ShardError, ShardResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Tag bit for 32-bit integer meta values
pub const META_INT_MASK: u8 = 0x80;

/// Tag bit for string meta values
pub const META_STR_MASK: u8 = 0x40;

/// Tag bit for 64-bit integer meta values
pub const META_LONG_MASK: u8 = 0x20;

/// 16-byte random document identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId([u8; 16]);

impl DocumentId {
    /// Fresh random identifier (uuid v4)
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).simple())
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| Self(u.into_bytes()))
    }
}

/// Value kind carried by a meta key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Int,
    Long,
    Str,
}

impl MetaKind {
    fn name(self) -> &'static str {
        match self {
            MetaKind::Int => "int",
            MetaKind::Long => "long",
            MetaKind::Str => "string",
        }
    }
}

macro_rules! meta_keys {
    ($($variant:ident = $tag:expr, $name:literal;)+) => {
        /// Every meta key a document may carry. The tag byte encodes both
        /// the key and its value kind.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MetaKey {
            $($variant,)+
        }

        impl MetaKey {
            /// All keys, in tag declaration order
            pub const ALL: &'static [MetaKey] = &[$(MetaKey::$variant,)+];

            /// Tag byte written to shards
            pub const fn tag(self) -> u8 {
                match self {
                    $(MetaKey::$variant => $tag,)+
                }
            }

            /// Key for a tag byte read from a shard
            pub fn from_tag(tag: u8) -> Option<Self> {
                match tag {
                    $(t if t == $tag => Some(MetaKey::$variant),)+
                    _ => None,
                }
            }

            /// Field name used in JSON output
            pub const fn name(self) -> &'static str {
                match self {
                    $(MetaKey::$variant => $name,)+
                }
            }
        }
    };
}

meta_keys! {
    Width = 1 | META_INT_MASK, "width";
    Height = 2 | META_INT_MASK, "height";
    Thumbnail = 3 | META_INT_MASK, "thumbnail";
    MediaDuration = 1 | META_LONG_MASK, "duration";
    MediaBitrate = 2 | META_LONG_MASK, "bitrate";
    Content = 1 | META_STR_MASK, "content";
    AudioCodec = 2 | META_STR_MASK, "audioc";
    VideoCodec = 3 | META_STR_MASK, "videoc";
    Artist = 4 | META_STR_MASK, "artist";
    Album = 5 | META_STR_MASK, "album";
    AlbumArtist = 6 | META_STR_MASK, "album_artist";
    Genre = 7 | META_STR_MASK, "genre";
    Title = 8 | META_STR_MASK, "title";
    FontName = 9 | META_STR_MASK, "font_name";
    Parent = 10 | META_STR_MASK, "parent";
    ExifMake = 11 | META_STR_MASK, "exif_make";
    ExifSoftware = 12 | META_STR_MASK, "exif_software";
    ExifExposureTime = 13 | META_STR_MASK, "exif_exposure_time";
    ExifFNumber = 14 | META_STR_MASK, "exif_fnumber";
    ExifFocalLength = 15 | META_STR_MASK, "exif_focal_length";
    ExifUserComment = 16 | META_STR_MASK, "exif_user_comment";
    ExifModel = 17 | META_STR_MASK, "exif_model";
    ExifIsoSpeedRatings = 18 | META_STR_MASK, "exif_iso_speed_ratings";
}

impl MetaKey {
    /// Value kind implied by the tag mask
    pub const fn kind(self) -> MetaKind {
        let tag = self.tag();
        if tag & META_INT_MASK != 0 {
            MetaKind::Int
        } else if tag & META_LONG_MASK != 0 {
            MetaKind::Long
        } else {
            MetaKind::Str
        }
    }
}

/// A typed meta value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    Int(i32),
    Long(i64),
    Str(String),
}

impl MetaValue {
    fn kind(&self) -> MetaKind {
        match self {
            MetaValue::Int(_) => MetaKind::Int,
            MetaValue::Long(_) => MetaKind::Long,
            MetaValue::Str(_) => MetaKind::Str,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            MetaValue::Int(v) => json!(v),
            MetaValue::Long(v) => json!(v),
            MetaValue::Str(v) => json!(v),
        }
    }
}

/// One key/value entry of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaLine {
    key: MetaKey,
    value: MetaValue,
}

impl MetaLine {
    /// Pair a key with a value of the matching kind.
    ///
    /// NUL bytes are stripped from strings since the shard format
    /// terminates strings with NUL.
    pub fn new(key: MetaKey, value: MetaValue) -> ShardResult<Self> {
        if key.kind() != value.kind() {
            return Err(ShardError::KindMismatch {
                key: key.name(),
                expected: key.kind().name(),
            });
        }
        let value = match value {
            MetaValue::Str(s) if s.contains('\0') => MetaValue::Str(s.replace('\0', "")),
            other => other,
        };
        Ok(Self { key, value })
    }

    /// String meta line
    pub fn text(key: MetaKey, value: impl Into<String>) -> ShardResult<Self> {
        Self::new(key, MetaValue::Str(value.into()))
    }

    pub fn key(&self) -> MetaKey {
        self.key
    }

    pub fn value(&self) -> &MetaValue {
        &self.value
    }

    /// Append the wire form (tag + value) to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.key.tag());
        match &self.value {
            MetaValue::Int(v) => buf.extend_from_slice(&v.to_ne_bytes()),
            MetaValue::Long(v) => buf.extend_from_slice(&v.to_ne_bytes()),
            MetaValue::Str(s) => {
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
            }
        }
    }
}

/// Byte offsets of the file name and of its extension within `path`.
///
/// The extension offset points just past the last `.` of the file name,
/// or at the end of the path when there is none. A file name whose only dot
/// is the leading one (`.bashrc`) has no extension.
pub fn path_offsets(path: &[u8]) -> (usize, usize) {
    let base = path
        .iter()
        .rposition(|&b| b == b'/')
        .map(|i| i + 1)
        .unwrap_or(0);
    let ext = match path[base..].iter().rposition(|&b| b == b'.') {
        Some(dot) if dot > 0 => base + dot + 1,
        _ => path.len(),
    };
    (base, ext)
}

/// One indexed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub inode: u64,
    pub size: u64,
    pub mime: u32,
    pub mtime: i64,
    /// Path relative to the scan root, raw OS bytes
    pub path: PathBuf,
    pub base: u16,
    pub ext: u16,
    pub meta: Vec<MetaLine>,
}

impl Document {
    /// Build a record for `path` (relative to the scan root)
    pub fn new(
        id: DocumentId,
        path: PathBuf,
        inode: u64,
        size: u64,
        mtime: i64,
        mime: u32,
    ) -> ShardResult<Self> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(ShardError::PathTooLong { len: bytes.len() });
        }
        let (base, ext) = path_offsets(bytes);
        Ok(Self {
            id,
            inode,
            size,
            mime,
            mtime,
            path,
            base: base as u16,
            ext: ext as u16,
            meta: Vec::new(),
        })
    }

    pub fn push_meta(&mut self, line: MetaLine) {
        self.meta.push(line);
    }

    /// First value for `key`
    pub fn meta(&self, key: MetaKey) -> Option<&MetaValue> {
        self.meta.iter().find(|m| m.key == key).map(|m| &m.value)
    }

    /// File name component
    pub fn name(&self) -> &OsStr {
        self.path_from(self.base)
    }

    /// Extension without the dot (empty if none)
    pub fn extension(&self) -> &OsStr {
        self.path_from(self.ext)
    }

    fn path_from(&self, offset: u16) -> &OsStr {
        let bytes = self.path.as_os_str().as_bytes();
        OsStr::from_bytes(bytes.get(offset as usize..).unwrap_or_default())
    }

    /// JSON object for dump output
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("_id".into(), json!(self.id.to_string()));
        obj.insert("path".into(), json!(self.path.to_string_lossy()));
        obj.insert("name".into(), json!(self.name().to_string_lossy()));
        obj.insert("extension".into(), json!(self.extension().to_string_lossy()));
        obj.insert("inode".into(), json!(self.inode));
        obj.insert("size".into(), json!(self.size));
        obj.insert("mime".into(), json!(self.mime));
        obj.insert("mtime".into(), json!(self.mtime));
        for line in &self.meta {
            obj.insert(line.key.name().into(), line.value.to_json());
        }
        Value::Object(obj)
    }
}
