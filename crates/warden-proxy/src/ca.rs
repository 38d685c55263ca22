//! Root CA used to sign per-host certificates.
//!
//! Generated once into the data directory and reused across runs. The
//! certificate can be exported so clients can be told to trust it.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

const CA_CERT_FILENAME: &str = "warden-ca.crt";
const CA_KEY_FILENAME: &str = "warden-ca.key";
const CA_COMMON_NAME: &str = "Warden Root CA";

/// Per-host certificates kept in memory.
const CERT_CACHE_SIZE: u64 = 1000;

/// Manages the root CA certificate for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a CA manager storing its files in `ca_dir`.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager under the platform data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("org", "warden", "warden")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA, generating it first if necessary.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let cert = ca_params()?
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the CA certificate and creates a hudsucker authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, CERT_CACHE_SIZE, default_provider()))
    }

    /// Reads the stored CA certificate as DER bytes.
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let parsed = pem::parse(cert_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        Ok(parsed.into_contents())
    }

    /// Copies the CA certificate (PEM) to `dest`, generating the CA if needed.
    ///
    /// A `.der` or `.cer` extension writes DER instead.
    pub fn export(&self, dest: impl AsRef<Path>) -> Result<PathBuf, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }

        let dest = dest.as_ref();
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let der = matches!(
            dest.extension().and_then(|e| e.to_str()),
            Some("der") | Some("cer")
        );

        if der {
            fs::write(dest, self.read_cert_der()?)
        } else {
            fs::copy(self.cert_path(), dest).map(|_| ())
        }
        .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Exported CA certificate to {:?}", dest);
        Ok(dest.to_path_buf())
    }
}

fn ca_params() -> Result<CertificateParams, CaManagerError> {
    let mut params = CertificateParams::new(vec![CA_COMMON_NAME.to_string()])
        .map_err(|e| CaManagerError::Generation(e.to_string()))?;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    Ok(params)
}
