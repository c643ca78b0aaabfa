use crate::error::{OtaError, Result};
use crate::exec::CommandRunner;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CERT_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";
pub const DEV_HOSTNAME: &str = "localhost";
pub const CERT_VALIDITY_DAYS: u32 = 365;

/// Certificate/key pair on disk. `exists` is false when provisioning could
/// not produce usable files; callers decide whether that is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub exists: bool,
}

impl CertificateBundle {
    pub fn in_dir<P: AsRef<Path>>(certs_dir: P) -> Self {
        let certs_dir = certs_dir.as_ref();
        let cert_path = certs_dir.join(CERT_FILE);
        let key_path = certs_dir.join(KEY_FILE);
        let exists = cert_path.is_file() && key_path.is_file();
        Self {
            cert_path,
            key_path,
            exists,
        }
    }

    fn refresh(mut self) -> Self {
        self.exists = self.cert_path.is_file() && self.key_path.is_file();
        self
    }

    fn missing(mut self) -> Self {
        self.exists = false;
        self
    }
}

/// Hostname the server advertises, with the trust material for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub hostname: String,
    pub certs: CertificateBundle,
}

/// Reuses an existing pair in `certs_dir`, otherwise generates a
/// self-signed RSA certificate for `localhost` with openssl.
pub fn provision_development(runner: &dyn CommandRunner, certs_dir: &Path) -> Provisioned {
    let bundle = CertificateBundle::in_dir(certs_dir);
    if bundle.exists {
        tracing::info!(cert = %bundle.cert_path.display(), "reusing development certificate");
        return Provisioned {
            hostname: DEV_HOSTNAME.to_string(),
            certs: bundle,
        };
    }

    tracing::info!("generating self-signed development certificate");
    let certs = match generate_self_signed(runner, &bundle) {
        Ok(()) => {
            let bundle = bundle.refresh();
            if !bundle.exists {
                tracing::warn!("openssl reported success but the certificate files are missing");
            }
            bundle
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not generate development certificate");
            bundle.missing()
        }
    };

    Provisioned {
        hostname: DEV_HOSTNAME.to_string(),
        certs,
    }
}

fn generate_self_signed(runner: &dyn CommandRunner, bundle: &CertificateBundle) -> Result<()> {
    if let Some(parent) = bundle.cert_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let args: Vec<String> = vec![
        "req".into(),
        "-x509".into(),
        "-newkey".into(),
        "rsa:2048".into(),
        "-nodes".into(),
        "-keyout".into(),
        bundle.key_path.display().to_string(),
        "-out".into(),
        bundle.cert_path.display().to_string(),
        "-days".into(),
        CERT_VALIDITY_DAYS.to_string(),
        "-subj".into(),
        format!("/CN={}", DEV_HOSTNAME),
    ];

    let output = runner.run("openssl", &args)?;
    if !output.success {
        return Err(OtaError::ToolFailed(format!(
            "openssl: {}",
            output.diagnostic()
        )));
    }
    Ok(())
}

/// Subset of `tailscale status --json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TailscaleStatus {
    #[serde(default)]
    pub backend_state: String,
    #[serde(rename = "Self", default)]
    pub self_node: Option<TailscaleNode>,
    #[serde(rename = "MagicDNSSuffix", default)]
    pub magic_dns_suffix: Option<String>,
    #[serde(default)]
    pub current_tailnet: Option<TailscaleTailnet>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TailscaleNode {
    #[serde(rename = "DNSName", default)]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TailscaleTailnet {
    #[serde(rename = "MagicDNSSuffix", default)]
    pub magic_dns_suffix: Option<String>,
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(|s| s.trim().trim_end_matches('.')).filter(|s| !s.is_empty())
}

impl TailscaleStatus {
    pub fn is_running(&self) -> bool {
        self.backend_state == "Running"
    }

    /// First label of the node's MagicDNS name, falling back to its OS hostname.
    pub fn machine_name(&self) -> Option<String> {
        let node = self.self_node.as_ref()?;
        let from_dns = non_empty(node.dns_name.as_deref())
            .and_then(|dns| dns.split('.').next())
            .filter(|label| !label.is_empty());

        from_dns
            .or_else(|| non_empty(node.host_name.as_deref()))
            .map(|name| name.to_lowercase())
    }

    pub fn tailnet_suffix(&self) -> Option<String> {
        non_empty(self.magic_dns_suffix.as_deref())
            .or_else(|| {
                self.current_tailnet
                    .as_ref()
                    .and_then(|t| non_empty(t.magic_dns_suffix.as_deref()))
            })
            .map(str::to_string)
    }

    pub fn fqdn(&self) -> Option<String> {
        Some(format!("{}.{}", self.machine_name()?, self.tailnet_suffix()?))
    }
}

pub fn tailscale_status(runner: &dyn CommandRunner) -> Result<TailscaleStatus> {
    let args = vec!["status".to_string(), "--json".to_string()];
    let output = runner
        .run("tailscale", &args)
        .map_err(|e| OtaError::Provision(format!("cannot run tailscale: {}", e)))?;

    if !output.success {
        return Err(OtaError::Provision(format!(
            "tailscale status failed: {}",
            output.diagnostic()
        )));
    }

    serde_json::from_str(&output.stdout)
        .map_err(|e| OtaError::Provision(format!("unreadable tailscale status: {}", e)))
}

/// Resolves this node's tailnet hostname and asks tailscale for a
/// certificate for it. Only hostname resolution failures are errors.
pub fn provision_tailscale(runner: &dyn CommandRunner, certs_dir: &Path) -> Result<Provisioned> {
    let status = tailscale_status(runner)?;

    if !status.is_running() {
        return Err(OtaError::Provision(format!(
            "tailscale is not running (state: {})",
            if status.backend_state.is_empty() {
                "unknown"
            } else {
                status.backend_state.as_str()
            }
        )));
    }

    let hostname = status.fqdn().ok_or_else(|| {
        OtaError::Provision("tailscale did not report a machine name and tailnet suffix".into())
    })?;
    tracing::info!(%hostname, "resolved tailnet hostname");

    let bundle = CertificateBundle::in_dir(certs_dir);
    let certs = match request_certificate(runner, &bundle, &hostname) {
        Ok(()) => bundle.refresh(),
        Err(e) => {
            tracing::error!(%hostname, error = %e, "tailscale certificate request failed");
            bundle.missing()
        }
    };

    Ok(Provisioned { hostname, certs })
}

fn request_certificate(
    runner: &dyn CommandRunner,
    bundle: &CertificateBundle,
    hostname: &str,
) -> Result<()> {
    if let Some(parent) = bundle.cert_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let args: Vec<String> = vec![
        "cert".into(),
        "--cert-file".into(),
        bundle.cert_path.display().to_string(),
        "--key-file".into(),
        bundle.key_path.display().to_string(),
        hostname.to_string(),
    ];

    let output = runner.run("tailscale", &args)?;
    if !output.success {
        return Err(OtaError::ToolFailed(format!(
            "tailscale cert: {}",
            output.diagnostic()
        )));
    }
    Ok(())
}

pub fn provision(dev: bool, runner: &dyn CommandRunner, certs_dir: &Path) -> Result<Provisioned> {
    if dev {
        Ok(provision_development(runner, certs_dir))
    } else {
        provision_tailscale(runner, certs_dir)
    }
}
