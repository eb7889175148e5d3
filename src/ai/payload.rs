use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_MIME_TYPE: &str = "image/png";

/// Raw encoded image bytes together with their mime type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ImagePayload {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        let mime_type = mime_type.into();
        let mime_type = if mime_type.trim().is_empty() {
            DEFAULT_MIME_TYPE.to_string()
        } else {
            mime_type.trim().to_ascii_lowercase()
        };
        Self { mime_type, data }
    }

    pub fn from_path(path: &Path, data: Vec<u8>) -> Self {
        Self::new(mime_for_path(path).unwrap_or(DEFAULT_MIME_TYPE), data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    pub fn from_base64(mime_type: &str, encoded: &str) -> Result<Self, base64::DecodeError> {
        let data = BASE64.decode(encoded.trim().as_bytes())?;
        Ok(Self::new(mime_type, data))
    }

    pub fn sha256_hex(&self) -> String {
        let digest = Sha256::digest(&self.data);
        hex::encode(digest)
    }

    /// File extension matching the mime type, used when writing shards to disk.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "image/bmp" => "bmp",
            "image/tiff" => "tiff",
            _ => "png",
        }
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => return None,
    };
    Some(mime)
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|err| de::Error::custom(format!("invalid base64 image data: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn empty_mime_type_defaults_to_png() {
        let payload = ImagePayload::new("  ", vec![1, 2, 3]);
        assert_eq!(payload.mime_type, "image/png");
        assert_eq!(payload.extension(), "png");
    }

    #[test]
    fn mime_is_guessed_from_extension() {
        let payload = ImagePayload::from_path(&PathBuf::from("scan_01.JPG"), vec![0xff]);
        assert_eq!(payload.mime_type, "image/jpeg");
        assert_eq!(payload.extension(), "jpg");
        assert!(mime_for_path(&PathBuf::from("notes.txt")).is_none());
    }

    #[test]
    fn serializes_data_as_base64() {
        let payload = ImagePayload::new("image/jpeg", b"photo".to_vec());
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["mimeType"], "image/jpeg");
        assert_eq!(json["data"], "cGhvdG8=");

        let decoded: ImagePayload = serde_json::from_value(json).expect("deserialize");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn digest_is_stable_hex() {
        let payload = ImagePayload::new("image/png", b"abc".to_vec());
        assert_eq!(
            payload.sha256_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
