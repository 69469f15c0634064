use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fleetd_core::error::FleetError;
use fleetd_core::ipc::EmbeddedFileInfo;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const PAYLOAD_VERSION: &str = "1";

/// Rough content classification for files carried in an image payload.
/// Derived from filename heuristics; selects files on extraction, never
/// gates access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileTag {
    WorldBook,
    Character,
    Preset,
    Regex,
    Persona,
    Other,
}

impl std::fmt::Display for FileTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorldBook => write!(f, "world-book"),
            Self::Character => write!(f, "character"),
            Self::Preset => write!(f, "preset"),
            Self::Regex => write!(f, "regex"),
            Self::Persona => write!(f, "persona"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Tags a file by its (relative) path.
pub fn tag_for_path(path: &str) -> FileTag {
    let lower = path.to_ascii_lowercase();
    if lower.contains("world") {
        FileTag::WorldBook
    } else if lower.contains("regex") {
        FileTag::Regex
    } else if lower.contains("char") {
        FileTag::Character
    } else if lower.contains("preset") {
        FileTag::Preset
    } else if lower.contains("persona") {
        FileTag::Persona
    } else {
        FileTag::Other
    }
}

/// One file carried in a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFile {
    pub relative_path: String,
    pub tag: FileTag,
    pub content: Vec<u8>,
}

impl PayloadFile {
    pub fn new(relative_path: impl Into<String>, content: Vec<u8>) -> Self {
        let relative_path = relative_path.into();
        let tag = tag_for_path(&relative_path);
        Self {
            relative_path,
            tag,
            content,
        }
    }

    pub fn info(&self) -> EmbeddedFileInfo {
        EmbeddedFileInfo {
            path: self.relative_path.clone(),
            tag: self.tag.to_string(),
            size: self.content.len() as u64,
        }
    }
}

/// The logical content of one transport operation: an ordered file list
/// plus its manifest. Exists only transiently during embed/extract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedPayload {
    pub files: Vec<PayloadFile>,
}

impl EmbeddedPayload {
    pub fn manifest(&self) -> Vec<EmbeddedFileInfo> {
        self.files.iter().map(PayloadFile::info).collect()
    }

    /// Files whose tag is in `tags`; an empty filter keeps everything.
    pub fn filtered(&self, tags: &[FileTag]) -> Vec<&PayloadFile> {
        self.files
            .iter()
            .filter(|f| tags.is_empty() || tags.contains(&f.tag))
            .collect()
    }
}

/// On-the-wire form of the payload document.
#[derive(Serialize, Deserialize)]
struct PayloadDoc {
    version: String,
    files: Vec<FileDoc>,
}

#[derive(Serialize, Deserialize)]
struct FileDoc {
    path: String,
    tag: FileTag,
    size: u64,
    content: String,
}

/// Serializes the payload: JSON manifest with base64 file bodies,
/// zlib-compressed into one blob.
pub fn encode(payload: &EmbeddedPayload) -> Result<Vec<u8>, FleetError> {
    let doc = PayloadDoc {
        version: PAYLOAD_VERSION.to_string(),
        files: payload
            .files
            .iter()
            .map(|f| FileDoc {
                path: f.relative_path.clone(),
                tag: f.tag,
                size: f.content.len() as u64,
                content: BASE64.encode(&f.content),
            })
            .collect(),
    };
    let json = serde_json::to_vec(&doc)
        .map_err(|e| FleetError::InvalidContainerFormat(format!("manifest encoding: {e}")))?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decodes a payload blob back into its file set.
pub fn decode(blob: &[u8]) -> Result<EmbeddedPayload, FleetError> {
    let mut json = Vec::new();
    ZlibDecoder::new(blob)
        .read_to_end(&mut json)
        .map_err(|e| FleetError::InvalidContainerFormat(format!("payload inflate: {e}")))?;

    let doc: PayloadDoc = serde_json::from_slice(&json)
        .map_err(|e| FleetError::InvalidContainerFormat(format!("payload manifest: {e}")))?;

    let mut files = Vec::with_capacity(doc.files.len());
    for file in doc.files {
        let content = BASE64
            .decode(&file.content)
            .map_err(|e| FleetError::InvalidContainerFormat(format!("payload content: {e}")))?;
        files.push(PayloadFile {
            relative_path: file.path,
            tag: file.tag,
            content,
        });
    }
    Ok(EmbeddedPayload { files })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_follow_filename_heuristics() {
        assert_eq!(tag_for_path("data/world_book.json"), FileTag::WorldBook);
        assert_eq!(tag_for_path("regex_rules.json"), FileTag::Regex);
        assert_eq!(tag_for_path("characters/alice.json"), FileTag::Character);
        assert_eq!(tag_for_path("my_preset.json"), FileTag::Preset);
        assert_eq!(tag_for_path("personas/me.json"), FileTag::Persona);
        assert_eq!(tag_for_path("project.tar.gz"), FileTag::Other);
    }

    #[test]
    fn encode_decode_round_trips_byte_for_byte() {
        let payload = EmbeddedPayload {
            files: vec![
                PayloadFile::new("project.tar.gz", vec![0u8, 1, 2, 255, 254]),
                PayloadFile::new("world_info.json", b"{\"entries\": []}".to_vec()),
            ],
        };
        let blob = encode(&payload).unwrap();
        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn garbage_blob_is_rejected() {
        assert!(matches!(
            decode(b"definitely not zlib"),
            Err(FleetError::InvalidContainerFormat(_))
        ));
    }

    #[test]
    fn filter_selects_by_tag() {
        let payload = EmbeddedPayload {
            files: vec![
                PayloadFile::new("world_info.json", vec![1]),
                PayloadFile::new("notes.txt", vec![2]),
            ],
        };
        let world = payload.filtered(&[FileTag::WorldBook]);
        assert_eq!(world.len(), 1);
        assert_eq!(world[0].relative_path, "world_info.json");
        assert_eq!(payload.filtered(&[]).len(), 2);
    }
}
