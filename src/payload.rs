use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Standard alphabet, padding optional on input.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// How the textual `content` of a step is turned into packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Raw,
    Base64,
    Hex,
}

impl ContentEncoding {
    /// Decodes `content` into bytes.
    ///
    /// Malformed Base64 or hex input yields an empty vector instead of an
    /// error: a knock with a bad payload is still sent, just without data.
    pub fn decode(self, content: &str) -> Vec<u8> {
        match self {
            ContentEncoding::Raw => content.as_bytes().to_vec(),
            ContentEncoding::Base64 => BASE64.decode(content.trim()).unwrap_or_else(|e| {
                log::debug!("Ignoring invalid base64 payload: {}", e);
                Vec::new()
            }),
            ContentEncoding::Hex => {
                let digits: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(digits).unwrap_or_else(|e| {
                    log::debug!("Ignoring invalid hex payload: {}", e);
                    Vec::new()
                })
            }
        }
    }
}

pub fn decode(content: &str, encoding: ContentEncoding) -> Vec<u8> {
    encoding.decode(content)
}
