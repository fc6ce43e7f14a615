//! Local certificate authority for ingress TLS
//!
//! The engine holds a root key pair on disk and issues one leaf credential
//! covering every FQDN that ingress routes serve.
//!
//! # Issuance Model
//!
//! - The root is created once and reused on every run; it is never rotated
//!   automatically (delete the files to rotate)
//! - A leaf request generates its own key pair and a CSR carrying all SANs
//! - The root signs the CSR; the leaf key never passes through the signer
//! - A leaf is reissued only when its SAN set, decoded from the certificate
//!   itself, differs from the requested set (or it no longer verifies / is
//!   past 80% of its lifetime)

pub mod san;
pub mod store;

pub use san::SanSet;
pub use store::{AuthorityStore, LeafIssue, LeafMaterial, LeafState, RootState};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Default validity period for the root certificate (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Default validity period for leaf certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Rotation threshold as a fraction of TTL (80%)
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Organization written into every subject
const ORGANIZATION: &str = "homelab";

/// Compute certificate validity period from now
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn now_unix() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// On-disk material is present but unusable
    #[error("authority material corrupt: {0}")]
    Corrupt(String),

    /// Filesystem error while reading or writing material
    #[error(transparent)]
    Storage(#[from] homelab_common::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity, subject and SANs decoded from a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Names from the subjectAltName extension
    pub sans: SanSet,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let sans = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::ParseError(format!("invalid subjectAltName: {}", e)))?
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(general_name_to_string)
                    .collect::<SanSet>()
            })
            .unwrap_or_default();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            sans,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.not_after <= now_unix()
    }

    /// Check if certificate needs rotation (past 80% of TTL)
    pub fn needs_rotation(&self) -> bool {
        let lifetime = self.lifetime_secs() as f64;
        if lifetime <= 0.0 {
            return true;
        }
        let age = (now_unix() - self.not_before) as f64;
        age / lifetime >= ROTATION_THRESHOLD
    }
}

fn general_name_to_string(name: &GeneralName<'_>) -> Option<String> {
    match name {
        GeneralName::DNSName(dns) => Some(dns.to_string()),
        GeneralName::IPAddress(bytes) => match bytes.len() {
            4 => {
                let octets: [u8; 4] = (*bytes).try_into().ok()?;
                Some(std::net::Ipv4Addr::from(octets).to_string())
            }
            16 => {
                let octets: [u8; 16] = (*bytes).try_into().ok()?;
                Some(std::net::Ipv6Addr::from(octets).to_string())
            }
            _ => None,
        },
        _ => None,
    }
}

/// Whether `cert_pem` carries a valid signature from `ca_cert_pem`
pub fn is_signed_by(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

/// Root authority that signs leaf CSRs
#[derive(Clone)]
pub struct CertificateAuthority {
    /// Root key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded root certificate
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed root
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate root key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create root cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load the root from PEM material, validating both halves
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse root key: {}", e)))?;

        let _ = CertificateInfo::from_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Root certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Root private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Validity and subject of the root certificate
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load root key: {}", e)))
    }

    /// Sign a leaf CSR for `sans`, returning the certificate in PEM format.
    ///
    /// Subject, validity and usages are set here; SANs are forced to `sans`
    /// so the issued certificate never carries names the caller didn't ask for.
    pub fn sign_leaf(&self, csr_pem: &str, sans: &SanSet) -> Result<String> {
        if sans.is_empty() {
            return Err(PkiError::InvalidCsr(
                "leaf certificate needs at least one subject alternative name".to_string(),
            ));
        }

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        csr_params.params.distinguished_name = leaf_subject(sans);
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;
        csr_params.params.subject_alt_names = sans.to_san_types()?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed_cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(signed_cert.pem())
    }

    /// Generate a key and CSR for `sans` and sign it in one go
    pub fn issue_leaf(&self, sans: &SanSet) -> Result<LeafMaterial> {
        let request = LeafRequest::new(sans)?;
        let cert_pem = self.sign_leaf(request.csr_pem(), sans)?;
        Ok(LeafMaterial {
            cert_pem,
            key_pem: request.key_pem,
        })
    }
}

fn leaf_subject(sans: &SanSet) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    let common_name = sans.iter().next().unwrap_or("homelab").to_string();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Leaf key pair plus a CSR embedding every requested SAN
pub struct LeafRequest {
    key_pem: String,
    csr_pem: String,
}

impl LeafRequest {
    /// Generate a fresh key pair and CSR for `sans`
    pub fn new(sans: &SanSet) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let mut params = CertificateParams::default();
        params.distinguished_name = leaf_subject(sans);
        params.subject_alt_names = sans.to_san_types()?;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;

        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    /// CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}
