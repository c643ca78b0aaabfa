pub mod certs;
pub mod config;
pub mod error;
pub mod exec;
pub mod ipa;
pub mod manifest;
pub mod plist_ext;
pub mod scanner;
pub mod server;
pub mod tls;

pub use certs::{provision, CertificateBundle, Provisioned};
pub use config::{Cli, ServerConfig};
pub use error::{ExtractionError, OtaError, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use ipa::{extract_metadata, AppMetadata};
pub use manifest::{format_file_size, ManifestData};
pub use plist_ext::PlistFile;
pub use scanner::{scan_dir, ArchiveInfo};
pub use server::{
    build_router, prepare, run, serve, serve_with, AppState, Prepared, ServeOnce, TransferOutcome,
};
