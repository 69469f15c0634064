use fleetd_core::error::FleetError;
use fleetd_core::ipc::EmbeddedFileInfo;

use super::payload::{self, EmbeddedPayload};

/// The eight-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Chunk type carrying an embedded payload: ancillary (lowercase first
/// letter), private (lowercase second), copy-safe (lowercase fourth), so
/// any standards-conforming PNG editor preserves it and any viewer
/// ignores it.
pub const PAYLOAD_CHUNK_TYPE: [u8; 4] = *b"flEt";

const IEND: [u8; 4] = *b"IEND";

/// One parsed chunk, borrowing the container.
struct Chunk<'a> {
    type_code: [u8; 4],
    data: &'a [u8],
    /// The full length/type/data/crc span, for byte-for-byte pass-through.
    raw: &'a [u8],
}

/// Splits a PNG into its chunk sequence, validating the signature, chunk
/// framing, and IEND termination. Bytes after IEND are ignored.
fn parse_chunks(container: &[u8]) -> Result<Vec<Chunk<'_>>, FleetError> {
    if container.len() < PNG_SIGNATURE.len() || container[..8] != PNG_SIGNATURE {
        return Err(FleetError::InvalidContainerFormat(
            "missing PNG signature".to_string(),
        ));
    }

    let mut chunks = Vec::new();
    let mut pos = PNG_SIGNATURE.len();
    loop {
        if container.len() - pos < 12 {
            return Err(FleetError::InvalidContainerFormat(
                "truncated chunk header".to_string(),
            ));
        }
        let length =
            u32::from_be_bytes([container[pos], container[pos + 1], container[pos + 2], container[pos + 3]])
                as usize;
        let total = 12usize
            .checked_add(length)
            .ok_or_else(|| FleetError::InvalidContainerFormat("chunk length overflow".to_string()))?;
        if container.len() - pos < total {
            return Err(FleetError::InvalidContainerFormat(
                "chunk data exceeds container".to_string(),
            ));
        }

        let mut type_code = [0u8; 4];
        type_code.copy_from_slice(&container[pos + 4..pos + 8]);
        let data = &container[pos + 8..pos + 8 + length];
        let raw = &container[pos..pos + total];
        pos += total;
        let is_end = type_code == IEND;
        chunks.push(Chunk {
            type_code,
            data,
            raw,
        });
        if is_end {
            return Ok(chunks);
        }
        if pos >= container.len() {
            return Err(FleetError::InvalidContainerFormat(
                "no IEND chunk".to_string(),
            ));
        }
    }
}

fn crc32(type_code: &[u8; 4], data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(type_code);
    crc.update(data);
    crc.sum()
}

/// Frames one chunk: 4-byte big-endian length, 4-byte type, data, 4-byte
/// CRC32 over type + data.
fn build_chunk(type_code: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(12 + data.len());
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(&type_code);
    chunk.extend_from_slice(data);
    chunk.extend_from_slice(&crc32(&type_code, data).to_be_bytes());
    chunk
}

/// Validates that `container` is a structurally well-formed PNG.
pub fn validate(container: &[u8]) -> Result<(), FleetError> {
    parse_chunks(container).map(|_| ())
}

/// Embeds a payload into a PNG container.
///
/// The payload is serialized, wrapped as one `flEt` chunk, and inserted
/// immediately before IEND; every other chunk passes through byte-for-byte,
/// so the result stays a valid, displayable image. Re-embedding replaces:
/// any payload chunk already present is dropped, so a container carries at
/// most one payload and extraction is unambiguous.
pub fn embed(container: &[u8], payload: &EmbeddedPayload) -> Result<Vec<u8>, FleetError> {
    let chunks = parse_chunks(container)?;
    let blob = payload::encode(payload)?;
    let payload_chunk = build_chunk(PAYLOAD_CHUNK_TYPE, &blob);

    let mut out = Vec::with_capacity(container.len() + payload_chunk.len());
    out.extend_from_slice(&PNG_SIGNATURE);
    for chunk in &chunks {
        if chunk.type_code == PAYLOAD_CHUNK_TYPE {
            continue;
        }
        if chunk.type_code == IEND {
            out.extend_from_slice(&payload_chunk);
        }
        out.extend_from_slice(chunk.raw);
    }
    Ok(out)
}

/// Extracts the embedded payload, if any. The first payload chunk wins;
/// a well-formed PNG without one yields `NotEmbedded`.
pub fn extract(container: &[u8]) -> Result<EmbeddedPayload, FleetError> {
    let chunks = parse_chunks(container)?;
    for chunk in &chunks {
        if chunk.type_code != PAYLOAD_CHUNK_TYPE {
            continue;
        }
        let expected = u32::from_be_bytes(chunk.raw[chunk.raw.len() - 4..].try_into().unwrap());
        if crc32(&chunk.type_code, chunk.data) != expected {
            return Err(FleetError::InvalidContainerFormat(
                "payload chunk CRC mismatch".to_string(),
            ));
        }
        return payload::decode(chunk.data);
    }
    Err(FleetError::NotEmbedded)
}

/// Cheap presence check: scans for a payload chunk without decoding it.
/// Malformed containers answer false rather than erroring.
pub fn is_embedded(container: &[u8]) -> bool {
    match parse_chunks(container) {
        Ok(chunks) => chunks.iter().any(|c| c.type_code == PAYLOAD_CHUNK_TYPE),
        Err(_) => false,
    }
}

/// Manifest of the embedded payload without file contents, or None when
/// the container carries no payload.
pub fn inspect(container: &[u8]) -> Result<Option<Vec<EmbeddedFileInfo>>, FleetError> {
    match extract(container) {
        Ok(payload) => Ok(Some(payload.manifest())),
        Err(FleetError::NotEmbedded) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::payload::PayloadFile;

    /// Smallest plausible PNG: signature, IHDR, one IDAT, IEND.
    fn minimal_png() -> Vec<u8> {
        let mut png = Vec::new();
        png.extend_from_slice(&PNG_SIGNATURE);
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&1u32.to_be_bytes()); // width
        ihdr.extend_from_slice(&1u32.to_be_bytes()); // height
        ihdr.extend_from_slice(&[8, 0, 0, 0, 0]); // depth, color, etc.
        png.extend_from_slice(&build_chunk(*b"IHDR", &ihdr));
        png.extend_from_slice(&build_chunk(*b"IDAT", &[0x78, 0x9c, 0x62, 0x00, 0x00]));
        png.extend_from_slice(&build_chunk(*b"IEND", &[]));
        png
    }

    fn sample_payload() -> EmbeddedPayload {
        EmbeddedPayload {
            files: vec![PayloadFile::new(
                "project.tar.gz",
                vec![0x1f, 0x8b, 1, 2, 3, 4, 5],
            )],
        }
    }

    #[test]
    fn embed_extract_round_trips_byte_for_byte() {
        let png = minimal_png();
        let payload = sample_payload();

        let embedded = embed(&png, &payload).unwrap();
        let extracted = extract(&embedded).unwrap();
        assert_eq!(extracted, payload);
    }

    #[test]
    fn embed_output_is_still_a_valid_png() {
        let png = minimal_png();
        let embedded = embed(&png, &sample_payload()).unwrap();

        validate(&embedded).unwrap();
        // Every original chunk must survive byte-for-byte.
        let original = parse_chunks(&png).unwrap();
        let modified = parse_chunks(&embedded).unwrap();
        for chunk in &original {
            assert!(modified.iter().any(|c| c.raw == chunk.raw));
        }
        // And the payload chunk sits immediately before IEND.
        let types: Vec<[u8; 4]> = modified.iter().map(|c| c.type_code).collect();
        let payload_idx = types.iter().position(|t| *t == PAYLOAD_CHUNK_TYPE).unwrap();
        assert_eq!(types[payload_idx + 1], IEND);
    }

    #[test]
    fn plain_png_is_not_embedded() {
        let png = minimal_png();
        assert!(!is_embedded(&png));
        assert!(matches!(extract(&png), Err(FleetError::NotEmbedded)));
        assert!(inspect(&png).unwrap().is_none());
    }

    #[test]
    fn re_embedding_replaces_the_previous_payload() {
        let png = minimal_png();
        let first = embed(&png, &sample_payload()).unwrap();

        let second_payload = EmbeddedPayload {
            files: vec![PayloadFile::new("world_book.json", b"{}".to_vec())],
        };
        let second = embed(&first, &second_payload).unwrap();

        let payload_chunks = parse_chunks(&second)
            .unwrap()
            .iter()
            .filter(|c| c.type_code == PAYLOAD_CHUNK_TYPE)
            .count();
        assert_eq!(payload_chunks, 1);
        assert_eq!(extract(&second).unwrap(), second_payload);
    }

    #[test]
    fn invalid_containers_are_rejected() {
        assert!(matches!(
            extract(b"not a png at all"),
            Err(FleetError::InvalidContainerFormat(_))
        ));
        assert!(!is_embedded(b"not a png at all"));

        // Signature but garbage chunk framing.
        let mut bad = PNG_SIGNATURE.to_vec();
        bad.extend_from_slice(&[0xff; 6]);
        assert!(matches!(
            validate(&bad),
            Err(FleetError::InvalidContainerFormat(_))
        ));

        // Well-formed chunks but no IEND.
        let mut no_end = PNG_SIGNATURE.to_vec();
        no_end.extend_from_slice(&build_chunk(*b"IHDR", &[0; 13]));
        assert!(matches!(
            validate(&no_end),
            Err(FleetError::InvalidContainerFormat(_))
        ));
    }

    #[test]
    fn corrupted_payload_crc_is_detected() {
        let png = minimal_png();
        let mut embedded = embed(&png, &sample_payload()).unwrap();

        // Flip the first data byte after the payload chunk's type code.
        let pos = embedded
            .windows(4)
            .position(|w| w == PAYLOAD_CHUNK_TYPE)
            .unwrap();
        embedded[pos + 4] ^= 0xff;

        assert!(matches!(
            extract(&embedded),
            Err(FleetError::InvalidContainerFormat(_))
        ));
    }

    #[test]
    fn inspect_lists_the_manifest_without_content() {
        let png = minimal_png();
        let embedded = embed(&png, &sample_payload()).unwrap();
        let files = inspect(&embedded).unwrap().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "project.tar.gz");
        assert_eq!(files[0].tag, "other");
        assert_eq!(files[0].size, 7);
    }
}
