use crate::error::ExtractionError;
use plist::Value;
use std::io::Cursor;

/// Leading bytes of a binary property list (`bplist00`).
const BINARY_MAGIC: &[u8] = b"bpl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlistEncoding {
    Binary,
    Xml,
}

impl PlistEncoding {
    /// Only the first three bytes are inspected; anything that is not
    /// binary is treated as XML text.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(BINARY_MAGIC) {
            PlistEncoding::Binary
        } else {
            PlistEncoding::Xml
        }
    }
}

/// A decoded property-list dictionary, independent of how it was encoded.
#[derive(Debug, Clone)]
pub struct PlistFile {
    pub data: plist::Dictionary,
}

impl PlistFile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ExtractionError> {
        let value = match PlistEncoding::sniff(bytes) {
            PlistEncoding::Binary => Value::from_reader(Cursor::new(bytes))?,
            PlistEncoding::Xml => {
                let text = std::str::from_utf8(bytes)?;
                Value::from_reader_xml(text.as_bytes())?
            }
        };

        let data = value
            .into_dictionary()
            .ok_or(ExtractionError::NotADictionary)?;

        Ok(Self { data })
    }

    /// Returns the string under `key`, treating empty strings as absent.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|v| v.as_string())
            .filter(|s| !s.is_empty())
    }

    /// First non-empty string among `keys`, in order.
    pub fn first_string(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get_string(key))
    }
}
