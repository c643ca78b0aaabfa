use crate::error::{OtaError, Result};
use crate::scanner::is_ipa;
use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_PORT: u32 = 8443;

#[derive(Parser, Debug, Clone)]
#[command(name = "ota-serve")]
#[command(about = "Serve an iOS app over the air with an itms-services manifest")]
#[command(version)]
pub struct Cli {
    /// Development mode: localhost with a self-signed certificate
    #[arg(short, long)]
    pub dev: bool,

    /// Port to listen on (1-65535)
    #[arg(short, long, env = "OTA_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u32,

    /// Serve this .ipa instead of the newest one in --dir
    #[arg(short, long)]
    pub ipa: Option<PathBuf>,

    /// Exit after the archive has been downloaded once
    #[arg(short = 'o', long = "once")]
    pub serve_once: bool,

    /// Hostname advertised in development mode (default: localhost)
    #[arg(long)]
    pub host: Option<String>,

    /// Refuse to fall back to plain HTTP in development mode
    #[arg(long)]
    pub https: bool,

    /// Directory scanned for .ipa files
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Output directory for the generated manifest, install page and certificates
    #[arg(long, default_value = "dist")]
    pub dist: PathBuf,

    /// Directory holding manifest.plist / install.html template overrides
    #[arg(long, default_value = "templates")]
    pub templates: PathBuf,

    /// PNG shown by iOS while the app installs
    #[arg(long)]
    pub icon: Option<PathBuf>,
}

/// Validated operating parameters for one server run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub dev: bool,
    pub ipa_path: Option<PathBuf>,
    /// Advertised hostname override; only honoured in development mode,
    /// production always uses the tailnet name.
    pub hostname: Option<String>,
    pub require_https: bool,
    pub serve_once: bool,
    pub work_dir: PathBuf,
    pub dist_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub icon_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn certs_dir(&self) -> PathBuf {
        self.dist_dir.join("certs")
    }
}

pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(OtaError::Validation(format!(
            "port must be between 1 and 65535, got {}",
            port
        ))),
    }
}

impl Cli {
    /// Checks arguments before anything is scanned, provisioned or bound.
    pub fn into_config(self) -> Result<ServerConfig> {
        let port = validate_port(self.port)?;

        if let Some(ref ipa) = self.ipa {
            if !is_ipa(ipa) {
                return Err(OtaError::Validation(format!(
                    "{} is not an .ipa file",
                    ipa.display()
                )));
            }
            if !ipa.is_file() {
                return Err(OtaError::Validation(format!(
                    "{} does not exist",
                    ipa.display()
                )));
            }
        }

        if let Some(ref icon) = self.icon {
            if !icon.is_file() {
                return Err(OtaError::Validation(format!(
                    "icon {} does not exist",
                    icon.display()
                )));
            }
        }

        Ok(ServerConfig {
            port,
            dev: self.dev,
            ipa_path: self.ipa,
            hostname: self.host.filter(|h| !h.trim().is_empty()),
            require_https: !self.dev || self.https,
            serve_once: self.serve_once,
            work_dir: self.dir,
            dist_dir: self.dist,
            templates_dir: self.templates,
            icon_path: self.icon,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_bounds() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(70000).is_err());
        assert!(validate_port(65536).is_err());
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(65535).unwrap(), 65535);
    }

    #[test]
    fn https_required_outside_dev() {
        let config = Cli::try_parse_from(["ota-serve"]).unwrap().into_config().unwrap();
        assert!(!config.dev);
        assert!(config.require_https);

        let config = Cli::try_parse_from(["ota-serve", "--dev"])
            .unwrap()
            .into_config()
            .unwrap();
        assert!(!config.require_https);

        let config = Cli::try_parse_from(["ota-serve", "--dev", "--https", "--once"])
            .unwrap()
            .into_config()
            .unwrap();
        assert!(config.require_https);
        assert!(config.serve_once);
    }
}
