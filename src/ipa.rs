use crate::error::ExtractionError;
use crate::plist_ext::PlistFile;
use glob::Pattern;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Entry path of an app bundle's Info.plist inside an IPA. `*` may span
/// directories, so nested bundles (watch apps) match too.
pub const INFO_PLIST_PATTERN: &str = "*.app/Info.plist";

pub const UNKNOWN_APP_NAME: &str = "Unknown App";

/// Largest Info.plist read out of an archive.
pub const MAX_INFO_PLIST_SIZE: u64 = 1 << 20;

/// Identifying fields read from an app's Info.plist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMetadata {
    pub bundle_id: String,
    pub version: String,
    pub display_name: String,
    pub build_number: Option<String>,
}

impl AppMetadata {
    pub fn from_plist(plist: &PlistFile) -> Result<Self, ExtractionError> {
        let bundle_id = plist.get_string("CFBundleIdentifier");
        let version = plist.first_string(&["CFBundleShortVersionString", "CFBundleVersion"]);

        let (Some(bundle_id), Some(version)) = (bundle_id, version) else {
            return Err(ExtractionError::MissingMetadata);
        };

        let display_name = plist
            .first_string(&["CFBundleDisplayName", "CFBundleName"])
            .unwrap_or(UNKNOWN_APP_NAME);

        Ok(Self {
            bundle_id: bundle_id.to_string(),
            version: version.to_string(),
            display_name: display_name.to_string(),
            build_number: plist.get_string("CFBundleVersion").map(str::to_string),
        })
    }
}

/// Raw bytes of the first entry matching [`INFO_PLIST_PATTERN`], in archive order.
pub fn read_info_plist<P: AsRef<Path>>(ipa_path: P) -> Result<Vec<u8>, ExtractionError> {
    let file = File::open(ipa_path.as_ref())?;
    let mut archive = zip::ZipArchive::new(file)?;
    let pattern = Pattern::new(INFO_PLIST_PATTERN)?;

    let index = (0..archive.len())
        .find(|&i| {
            archive
                .by_index_raw(i)
                .map(|entry| pattern.matches(entry.name()))
                .unwrap_or(false)
        })
        .ok_or(ExtractionError::InfoPlistNotFound)?;

    // The declared size comes from the archive and is not trusted.
    let mut entry = archive.by_index(index)?;
    let mut buffer = Vec::with_capacity(entry.size().min(MAX_INFO_PLIST_SIZE) as usize);
    (&mut entry)
        .take(MAX_INFO_PLIST_SIZE + 1)
        .read_to_end(&mut buffer)?;

    if buffer.len() as u64 > MAX_INFO_PLIST_SIZE {
        return Err(ExtractionError::InfoPlistTooLarge(MAX_INFO_PLIST_SIZE));
    }
    Ok(buffer)
}

pub fn extract_metadata<P: AsRef<Path>>(ipa_path: P) -> Result<AppMetadata, ExtractionError> {
    let bytes = read_info_plist(ipa_path)?;
    let plist = PlistFile::from_bytes(&bytes)?;
    AppMetadata::from_plist(&plist)
}
