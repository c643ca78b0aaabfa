//! Certificate provisioning against fake openssl / tailscale tools.

mod common;

use common::{FakeRunner, RUNNING_STATUS};
use ota_serve::certs::{
    provision, provision_development, provision_tailscale, CERT_FILE, DEV_HOSTNAME, KEY_FILE,
};
use ota_serve::OtaError;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_development_pair_is_generated_then_reused() {
    let dist = TempDir::new().unwrap();
    let certs_dir = dist.path().join("certs");
    let runner = FakeRunner::default();

    let first = provision_development(&runner, &certs_dir);
    assert_eq!(first.hostname, DEV_HOSTNAME);
    assert!(first.certs.exists);
    assert_eq!(first.certs.cert_path, certs_dir.join(CERT_FILE));
    assert_eq!(first.certs.key_path, certs_dir.join(KEY_FILE));
    assert_eq!(runner.call_count("openssl"), 1);

    let (_, args) = &runner.calls()[0];
    assert!(args.iter().any(|a| a == "rsa:2048"));
    assert!(args.iter().any(|a| a == "365"));
    assert!(args.iter().any(|a| a == "/CN=localhost"));

    let cert_mtime = fs::metadata(&first.certs.cert_path).unwrap().modified().unwrap();
    let key_mtime = fs::metadata(&first.certs.key_path).unwrap().modified().unwrap();

    let second = provision_development(&runner, &certs_dir);
    assert_eq!(second, first);
    assert_eq!(runner.call_count("openssl"), 1);
    assert_eq!(
        fs::metadata(&second.certs.cert_path).unwrap().modified().unwrap(),
        cert_mtime
    );
    assert_eq!(
        fs::metadata(&second.certs.key_path).unwrap().modified().unwrap(),
        key_mtime
    );
}

#[test]
fn test_development_without_openssl_degrades() {
    let dist = TempDir::new().unwrap();
    let runner = FakeRunner::missing_tools();

    let provisioned = provision_development(&runner, &dist.path().join("certs"));
    assert_eq!(provisioned.hostname, DEV_HOSTNAME);
    assert!(!provisioned.certs.exists);
}

#[test]
fn test_development_openssl_failure_degrades() {
    let dist = TempDir::new().unwrap();
    let runner = FakeRunner {
        fail_certs: true,
        ..Default::default()
    };

    let provisioned = provision(true, &runner, &dist.path().join("certs")).unwrap();
    assert!(!provisioned.certs.exists);
}

#[test]
fn test_tailscale_certificate_for_tailnet_hostname() {
    let dist = TempDir::new().unwrap();
    let certs_dir = dist.path().join("certs");
    let runner = FakeRunner::tailscale(RUNNING_STATUS);

    let provisioned = provision_tailscale(&runner, &certs_dir).unwrap();
    assert_eq!(provisioned.hostname, "buildbox.tail-scale.ts.net");
    assert!(provisioned.certs.exists);

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, ["status", "--json"]);
    assert_eq!(calls[1].1[0], "cert");
    assert_eq!(calls[1].1.last().unwrap(), "buildbox.tail-scale.ts.net");
}

#[test]
fn test_tailscale_not_running_is_fatal() {
    let dist = TempDir::new().unwrap();
    let runner = FakeRunner::tailscale(r#"{ "BackendState": "Stopped" }"#);

    let err = provision(false, &runner, &dist.path().join("certs")).unwrap_err();
    assert!(matches!(err, OtaError::Provision(_)));
    assert!(err.to_string().contains("Stopped"));
    assert_eq!(runner.call_count("tailscale"), 1);
}

#[test]
fn test_tailscale_without_hostname_is_fatal() {
    let dist = TempDir::new().unwrap();
    let runner = FakeRunner::tailscale(r#"{ "BackendState": "Running", "Self": {} }"#);

    let err = provision_tailscale(&runner, &dist.path().join("certs")).unwrap_err();
    assert!(matches!(err, OtaError::Provision(_)));
}

#[test]
fn test_tailscale_unavailable_is_fatal() {
    let dist = TempDir::new().unwrap();

    let err = provision_tailscale(&FakeRunner::missing_tools(), dist.path()).unwrap_err();
    assert!(matches!(err, OtaError::Provision(_)));

    let err = provision_tailscale(&FakeRunner::default(), dist.path()).unwrap_err();
    assert!(matches!(err, OtaError::Provision(_)));

    let err = provision_tailscale(&FakeRunner::tailscale("not json"), dist.path()).unwrap_err();
    assert!(matches!(err, OtaError::Provision(_)));
}

#[test]
fn test_tailscale_cert_failure_flags_bundle() {
    let dist = TempDir::new().unwrap();
    let runner = FakeRunner {
        status_json: Some(RUNNING_STATUS.to_string()),
        fail_certs: true,
        ..Default::default()
    };

    let provisioned = provision_tailscale(&runner, &dist.path().join("certs")).unwrap();
    assert_eq!(provisioned.hostname, "buildbox.tail-scale.ts.net");
    assert!(!provisioned.certs.exists);
}
