//! The encoded image form: a `data:<mime>;base64,<payload>` string that
//! carries both the MIME type and the bytes of an uploaded image.

use base64::{engine::general_purpose, Engine as _};
use image::ImageFormat;
use serde::Serialize;

use crate::error::ImageDecodeError;

const DATA_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EncodedImage(String);

impl EncodedImage {
    /// Encodes raw file bytes. The MIME type is sniffed from the bytes; the
    /// declared type is only trusted when sniffing fails and it names an image.
    pub fn from_bytes(bytes: &[u8], declared_mime: Option<&str>) -> Result<Self, ImageDecodeError> {
        if bytes.is_empty() {
            return Err(ImageDecodeError::EmptyFile);
        }

        let mime = match image::guess_format(bytes).ok().and_then(mime_for_format) {
            Some(mime) => mime.to_string(),
            None => match declared_mime {
                Some(declared) if declared.starts_with("image/") => declared.to_string(),
                _ => return Err(ImageDecodeError::UnrecognizedFormat),
            },
        };

        let payload = general_purpose::STANDARD.encode(bytes);
        Ok(Self(format!("{DATA_PREFIX}{mime}{BASE64_MARKER},{payload}")))
    }

    pub fn parse(value: &str) -> Result<Self, ImageDecodeError> {
        let header = value
            .strip_prefix(DATA_PREFIX)
            .and_then(|rest| rest.split_once(','))
            .map(|(header, _)| header)
            .ok_or(ImageDecodeError::NotADataUrl)?;
        if !header.ends_with(BASE64_MARKER) {
            return Err(ImageDecodeError::MissingBase64Marker);
        }
        Ok(Self(value.to_string()))
    }

    pub fn mime_type(&self) -> &str {
        let header = self.header();
        header.split(';').next().unwrap_or(header)
    }

    pub fn payload(&self) -> &str {
        self.0.split_once(',').map(|(_, payload)| payload).unwrap_or("")
    }

    pub fn decode(&self) -> Result<Vec<u8>, ImageDecodeError> {
        Ok(general_purpose::STANDARD.decode(self.payload())?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn header(&self) -> &str {
        let rest = self.0.strip_prefix(DATA_PREFIX).unwrap_or(&self.0);
        rest.split_once(',').map(|(header, _)| header).unwrap_or(rest)
    }
}

fn mime_for_format(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::Tiff => Some("image/tiff"),
        ImageFormat::Ico => Some("image/x-icon"),
        ImageFormat::Avif => Some("image/avif"),
        _ => None,
    }
}
