use crate::error::Result;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const MANIFEST_FILE: &str = "manifest.plist";
pub const INSTALL_PAGE_FILE: &str = "install.html";

pub const DEFAULT_MANIFEST_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>items</key>
    <array>
        <dict>
            <key>assets</key>
            <array>
                <dict>
                    <key>kind</key>
                    <string>software-package</string>
                    <key>url</key>
                    <string>{{IPA_URL}}</string>
                </dict>{{ICON_ASSETS}}
            </array>
            <key>metadata</key>
            <dict>
                <key>bundle-identifier</key>
                <string>{{BUNDLE_ID}}</string>
                <key>bundle-version</key>
                <string>{{VERSION}}</string>
                <key>kind</key>
                <string>software</string>
                <key>title</key>
                <string>{{TITLE}}</string>
            </dict>
        </dict>
    </array>
</dict>
</plist>
"#;

const ICON_ASSETS: &str = r#"
                <dict>
                    <key>kind</key>
                    <string>display-image</string>
                    <key>url</key>
                    <string>{{ICON_SMALL_URL}}</string>
                </dict>
                <dict>
                    <key>kind</key>
                    <string>full-size-image</string>
                    <key>url</key>
                    <string>{{ICON_LARGE_URL}}</string>
                </dict>"#;

pub const DEFAULT_INSTALL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Install {{APP_NAME}}</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, sans-serif; background: #f2f2f7; margin: 0; padding: 2rem 1rem; color: #1c1c1e; }
        .card { max-width: 420px; margin: 0 auto; background: #fff; border-radius: 16px; padding: 2rem; text-align: center; box-shadow: 0 2px 12px rgba(0,0,0,0.08); }
        h1 { font-size: 1.6rem; margin: 0 0 0.5rem; }
        dl { display: grid; grid-template-columns: auto 1fr; gap: 0.35rem 1rem; text-align: left; margin: 1.5rem 0; font-size: 0.95rem; }
        dt { color: #8e8e93; }
        dd { margin: 0; word-break: break-all; }
        a.install { display: block; background: #007aff; color: #fff; text-decoration: none; padding: 0.9rem; border-radius: 12px; font-weight: 600; font-size: 1.1rem; }
        p.note { color: #8e8e93; font-size: 0.8rem; margin-top: 1.25rem; }
    </style>
</head>
<body>
    <div class="card">
        <h1>{{APP_NAME}}</h1>
        <dl>
            <dt>Version</dt><dd>{{VERSION}} ({{BUILD_NUMBER}})</dd>
            <dt>Bundle ID</dt><dd>{{BUNDLE_ID}}</dd>
            <dt>Size</dt><dd>{{FILE_SIZE}}</dd>
        </dl>
        <a class="install" href="{{INSTALL_URL}}">Install</a>
        <p class="note">Open this page in Safari on your iOS device. After installing, trust the developer profile under Settings &rsaquo; General &rsaquo; VPN &amp; Device Management.</p>
    </div>
</body>
</html>
"#;

/// Values for the OTA manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestData {
    pub bundle_id: String,
    pub version: String,
    pub title: String,
    pub ipa_url: String,
    pub icon_small_url: Option<String>,
    pub icon_large_url: Option<String>,
}

/// Values for the human-facing install page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPageData {
    pub app_name: String,
    pub version: String,
    pub build_number: Option<String>,
    pub bundle_id: String,
    pub install_url: String,
    pub manifest_url: String,
    pub file_size: u64,
}

/// `itms-services` link that makes iOS fetch and install from `manifest_url`.
pub fn install_link(manifest_url: &str) -> String {
    format!(
        "itms-services://?action=download-manifest&url={}",
        manifest_url
    )
}

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

/// Replaces every `{{KEY}}` occurrence, in the order given.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{{{}}}}}", key), value)
        })
}

/// Contents of `dir/name`, or `fallback` when that file does not exist.
pub fn load_template(dir: &Path, name: &str, fallback: &str) -> Result<String> {
    let path = dir.join(name);
    match fs::read_to_string(&path) {
        Ok(template) => {
            tracing::debug!(template = %path.display(), "using external template");
            Ok(template)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(fallback.to_string()),
        Err(e) => Err(e.into()),
    }
}

pub fn render_manifest(template: &str, data: &ManifestData) -> String {
    let icon_assets = match (&data.icon_small_url, &data.icon_large_url) {
        (Some(_), Some(_)) => ICON_ASSETS,
        _ => "",
    };

    substitute(
        template,
        &[
            ("ICON_ASSETS", icon_assets),
            ("BUNDLE_ID", data.bundle_id.as_str()),
            ("VERSION", data.version.as_str()),
            ("TITLE", data.title.as_str()),
            ("IPA_URL", data.ipa_url.as_str()),
            ("ICON_SMALL_URL", data.icon_small_url.as_deref().unwrap_or("")),
            ("ICON_LARGE_URL", data.icon_large_url.as_deref().unwrap_or("")),
        ],
    )
}

pub fn render_install_page(template: &str, data: &InstallPageData) -> String {
    let file_size = format_file_size(data.file_size);
    substitute(
        template,
        &[
            ("APP_NAME", data.app_name.as_str()),
            ("VERSION", data.version.as_str()),
            ("BUILD_NUMBER", data.build_number.as_deref().unwrap_or("-")),
            ("BUNDLE_ID", data.bundle_id.as_str()),
            ("INSTALL_URL", data.install_url.as_str()),
            ("MANIFEST_URL", data.manifest_url.as_str()),
            ("FILE_SIZE", file_size.as_str()),
        ],
    )
}

/// Writes `contents` to `path` via a sibling temp file so readers never
/// observe a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Renders the manifest into `dist_dir`, returning the written path.
pub fn generate_manifest(
    templates_dir: &Path,
    dist_dir: &Path,
    data: &ManifestData,
) -> Result<PathBuf> {
    let template = load_template(templates_dir, MANIFEST_FILE, DEFAULT_MANIFEST_TEMPLATE)?;
    let path = dist_dir.join(MANIFEST_FILE);
    write_atomic(&path, render_manifest(&template, data).as_bytes())?;
    tracing::info!(path = %path.display(), "generated manifest");
    Ok(path)
}

/// Renders the install page into `dist_dir`, returning the written path.
pub fn generate_install_page(
    templates_dir: &Path,
    dist_dir: &Path,
    data: &InstallPageData,
) -> Result<PathBuf> {
    let template = load_template(templates_dir, INSTALL_PAGE_FILE, DEFAULT_INSTALL_TEMPLATE)?;
    let path = dist_dir.join(INSTALL_PAGE_FILE);
    write_atomic(&path, render_install_page(&template, data).as_bytes())?;
    tracing::info!(path = %path.display(), "generated install page");
    Ok(path)
}
