//! File and collection info models
//!
//! The JSON documents published into the network that describe shared
//! files. Canonical form is sorted keys with compact separators, and
//! parsing then re-encoding a canonical document is byte-identical; the
//! struct fields are declared in sorted key order so plain serialization
//! produces the canonical bytes.

use lib_keys::KeyBytes;
use serde::{Deserialize, Serialize};

/// The type tag of a file info document
pub const FILE_INFO_NAME: &str = "BytestagFileInfo";

/// The type tag of a collection info document
pub const COLLECTION_INFO_NAME: &str = "BytestagCollectionInfo";

/// The canonical prefix a collection file starts with
pub const COLLECTION_COOKIE: &[u8] = b"{\"!\":\"BytestagCollectionInfo\"";

/// Model decoding errors
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wrong document type: {0}")]
    WrongType(String),
    #[error("bad key field: {0}")]
    Key(#[from] lib_keys::KeyError),
}

// Field order is the canonical (sorted) key order; do not reorder.
#[derive(Serialize, Deserialize)]
struct FileInfoWire {
    #[serde(rename = "!")]
    type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<Vec<String>>,
    hash: String,
    parts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

/// The hashes of a shared file and its parts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// SHA-1 of the whole file
    pub file_hash: KeyBytes,
    /// SHA-1 of each 256 KiB slice, in order
    pub part_hashes: Vec<KeyBytes>,
    pub size: Option<u64>,
    /// Filename path components
    pub filename: Option<Vec<String>>,
}

impl FileInfo {
    pub fn new(file_hash: KeyBytes, part_hashes: Vec<KeyBytes>) -> Self {
        FileInfo {
            file_hash,
            part_hashes,
            size: None,
            filename: None,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let wire: FileInfoWire = serde_json::from_slice(bytes)?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: FileInfoWire) -> Result<Self, ModelError> {
        if wire.type_name != FILE_INFO_NAME {
            return Err(ModelError::WrongType(wire.type_name));
        }

        let file_hash = KeyBytes::parse(&wire.hash)?;
        let part_hashes = wire
            .parts
            .iter()
            .map(|part| KeyBytes::parse(part))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FileInfo {
            file_hash,
            part_hashes,
            size: wire.size,
            filename: wire.filename,
        })
    }

    fn to_wire(&self) -> FileInfoWire {
        FileInfoWire {
            type_name: FILE_INFO_NAME.to_string(),
            filename: self.filename.clone(),
            hash: self.file_hash.base64(),
            parts: self.part_hashes.iter().map(KeyBytes::base64).collect(),
            size: self.size,
        }
    }

    /// Canonical JSON encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_wire()).expect("file info serializes")
    }

    /// The content hash of the canonical encoding, used as the pair index
    pub fn index(&self) -> KeyBytes {
        KeyBytes::new_hash(&self.to_bytes())
    }
}

// Field order is the canonical (sorted) key order; do not reorder.
#[derive(Serialize, Deserialize)]
struct CollectionInfoWire {
    #[serde(rename = "!")]
    type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
    files: Vec<FileInfoWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
}

/// An ordered set of file infos published as one document
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CollectionInfo {
    pub files: Vec<FileInfo>,
    pub comment: Option<String>,
    pub timestamp: Option<u64>,
}

impl CollectionInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let wire: CollectionInfoWire = serde_json::from_slice(bytes)?;

        if wire.type_name != COLLECTION_INFO_NAME {
            return Err(ModelError::WrongType(wire.type_name));
        }

        let files = wire
            .files
            .into_iter()
            .map(FileInfo::from_wire)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CollectionInfo {
            files,
            comment: wire.comment,
            timestamp: wire.timestamp,
        })
    }

    /// Canonical JSON encoding, starting with [`COLLECTION_COOKIE`]
    pub fn to_bytes(&self) -> Vec<u8> {
        let wire = CollectionInfoWire {
            type_name: COLLECTION_INFO_NAME.to_string(),
            comment: self.comment.clone(),
            files: self.files.iter().map(FileInfo::to_wire).collect(),
            timestamp: self.timestamp,
        };

        serde_json::to_vec(&wire).expect("collection info serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_round_trip() {
        let input = br#"{"!":"BytestagFileInfo","hash":"jbip9t8iC9lEz3jndkm5I2fTWV0=","parts":["jbip9t8iC9lEz3jndkm5I2fTWV0="]}"#;

        let info = FileInfo::from_bytes(input).unwrap();
        let encoded = info.to_bytes();

        assert_eq!(encoded.as_slice(), input.as_slice());
    }

    #[test]
    fn test_round_trip_with_optionals() {
        let mut info = FileInfo::new(
            KeyBytes::new_hash(b"file"),
            vec![KeyBytes::new_hash(b"part0"), KeyBytes::new_hash(b"part1")],
        );
        info.size = Some(524288);
        info.filename = Some(vec!["media".to_string(), "song.ogg".to_string()]);

        let bytes = info.to_bytes();
        let parsed = FileInfo::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, info);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_keys_are_sorted() {
        let mut info = FileInfo::new(KeyBytes::new_hash(b"x"), vec![]);
        info.size = Some(1);
        info.filename = Some(vec!["f".to_string()]);

        let text = String::from_utf8(info.to_bytes()).unwrap();
        let positions: Vec<usize> = ["\"!\"", "\"filename\"", "\"hash\"", "\"parts\"", "\"size\""]
            .iter()
            .map(|key| text.find(*key).expect(key))
            .collect();

        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let input = br#"{"!":"SomethingElse","hash":"jbip9t8iC9lEz3jndkm5I2fTWV0=","parts":[]}"#;

        assert!(matches!(
            FileInfo::from_bytes(input),
            Err(ModelError::WrongType(_))
        ));
    }

    #[test]
    fn test_collection_cookie_prefix() {
        let collection = CollectionInfo {
            files: vec![FileInfo::new(KeyBytes::new_hash(b"a"), vec![])],
            comment: Some("test set".to_string()),
            timestamp: Some(1700000000),
        };

        let bytes = collection.to_bytes();
        assert!(bytes.starts_with(COLLECTION_COOKIE));

        let parsed = CollectionInfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, collection);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_index_is_hash_of_bytes() {
        let info = FileInfo::new(KeyBytes::new_hash(b"whole"), vec![KeyBytes::new_hash(b"p")]);

        assert_eq!(info.index(), KeyBytes::new_hash(&info.to_bytes()));
    }
}
