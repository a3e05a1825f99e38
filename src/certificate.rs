//! Certificate authority for local TLS termination
//!
//! Mints a self-signed root and a leaf covering every tunnel source domain,
//! and keeps both in a certificate store so they are reused across runs.

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

/// Subject of the root certificate authority
pub const ROOT_SUBJECT: &str = "SnapTunnel Secure Certificate Authority";

/// Subject of the leaf certificate covering the tunnel domains
pub const DOMAIN_SUBJECT: &str = "SnapTunnel Wildcard Domain Secure Certificate Authority";

pub const ROOT_KEY_SIZE: usize = 4096;
pub const ROOT_VALID_YEARS: i64 = 10;
pub const DOMAIN_KEY_SIZE: usize = 2048;
pub const DOMAIN_VALID_YEARS: i64 = 2;

const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];

/// DER `BasicConstraints ::= SEQUENCE {}`, i.e. cA false
const NOT_CA_BASIC_CONSTRAINTS: &[u8] = &[0x30, 0x00];

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate {0} not found")]
    NotFound(String),

    #[error("Certificate {0} does not have a private key")]
    MissingPrivateKey(String),

    #[error("Certificate {subject} is invalid: {reason}")]
    Invalid { subject: String, reason: String },

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate store error: {0}")]
    Io(#[from] io::Error),
}

/// Where a certificate lives in a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    /// Trusted root authorities
    Root,
    /// Certificates with private keys used by this machine
    Personal,
}

impl StoreScope {
    fn dir_name(self) -> &'static str {
        match self {
            StoreScope::Root => "root",
            StoreScope::Personal => "my",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateLocation {
    pub subject: String,
    pub scope: StoreScope,
}

impl CertificateLocation {
    pub fn new(subject: &str, scope: StoreScope) -> Self {
        Self {
            subject: subject.to_string(),
            scope,
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_SUBJECT, StoreScope::Root)
    }

    pub fn domain() -> Self {
        Self::new(DOMAIN_SUBJECT, StoreScope::Personal)
    }
}

/// PEM certificate with its private key, when known
#[derive(Clone)]
pub struct Certificate {
    subject: String,
    cert_pem: String,
    key_pem: Option<String>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("has_private_key", &self.key_pem.is_some())
            .finish()
    }
}

impl Certificate {
    pub fn new(subject: &str, cert_pem: String, key_pem: Option<String>) -> Self {
        Self {
            subject: subject.to_string(),
            cert_pem,
            key_pem,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> Option<&str> {
        self.key_pem.as_deref()
    }

    pub fn has_private_key(&self) -> bool {
        self.key_pem.is_some()
    }

    pub fn cert_der(&self) -> Result<CertificateDer<'static>, CertificateError> {
        rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .next()
            .transpose()?
            .ok_or_else(|| CertificateError::Invalid {
                subject: self.subject.clone(),
                reason: "no PEM certificate block".to_string(),
            })
    }

    pub fn private_key_der(&self) -> Result<PrivateKeyDer<'static>, CertificateError> {
        let key_pem = self
            .key_pem
            .as_deref()
            .ok_or_else(|| CertificateError::MissingPrivateKey(self.subject.clone()))?;
        rustls_pemfile::private_key(&mut key_pem.as_bytes())?
            .ok_or_else(|| CertificateError::MissingPrivateKey(self.subject.clone()))
    }
}

/// Certificate store capability
pub trait CertificateStore: Send + Sync {
    /// Subject substring lookup, case-insensitive
    fn is_installed(&self, location: &CertificateLocation) -> Result<bool, CertificateError>;

    /// Load a certificate together with its private key
    fn get(&self, location: &CertificateLocation) -> Result<Certificate, CertificateError>;

    /// `Ok(false)` when access to the store is denied
    fn install(&self, certificate: &Certificate, scope: StoreScope) -> Result<bool, CertificateError>;

    /// `Ok(true)` when there was nothing to remove
    fn uninstall(&self, location: &CertificateLocation) -> Result<bool, CertificateError>;
}

/// Store keeping PEM files under `<dir>/<scope>/<subject>.{crt,key}`
pub struct FileCertificateStore {
    dir: PathBuf,
}

impl FileCertificateStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, CertificateError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File stem for a subject
    fn sanitize_subject(subject: &str) -> String {
        subject
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else if c == '*' {
                    'w'
                } else {
                    '-'
                }
            })
            .collect()
    }

    fn scope_dir(&self, scope: StoreScope) -> PathBuf {
        self.dir.join(scope.dir_name())
    }

    fn find(&self, location: &CertificateLocation) -> Result<Option<PathBuf>, CertificateError> {
        let dir = self.scope_dir(location.scope);
        let wanted = Self::sanitize_subject(&location.subject);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut matches = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let contains = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem.to_ascii_lowercase().contains(&wanted));
            if contains {
                matches.push(path);
            }
        }
        matches.sort();

        Ok(matches.into_iter().next())
    }

    fn write_file(path: &Path, content: &str, private: bool) -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if private {
                options.mode(0o600);
            }
        }
        #[cfg(not(unix))]
        let _ = private;

        let mut file = options.open(path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
    }

    fn try_install(&self, certificate: &Certificate, scope: StoreScope) -> io::Result<()> {
        let dir = self.scope_dir(scope);
        fs::create_dir_all(&dir)?;

        let stem = Self::sanitize_subject(&certificate.subject);
        Self::write_file(&dir.join(format!("{stem}.crt")), &certificate.cert_pem, false)?;
        if let Some(key_pem) = &certificate.key_pem {
            Self::write_file(&dir.join(format!("{stem}.key")), key_pem, true)?;
        }
        Ok(())
    }
}

impl CertificateStore for FileCertificateStore {
    fn is_installed(&self, location: &CertificateLocation) -> Result<bool, CertificateError> {
        Ok(self.find(location)?.is_some())
    }

    fn get(&self, location: &CertificateLocation) -> Result<Certificate, CertificateError> {
        let cert_path = self
            .find(location)?
            .ok_or_else(|| CertificateError::NotFound(location.subject.clone()))?;
        let cert_pem = fs::read_to_string(&cert_path)?;

        let key_path = cert_path.with_extension("key");
        let key_pem = match fs::read_to_string(&key_path) {
            Ok(key) => key,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CertificateError::MissingPrivateKey(location.subject.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let certificate = Certificate::new(&location.subject, cert_pem, Some(key_pem));
        // Both halves must parse before the certificate is handed out.
        certificate.cert_der()?;
        certificate.private_key_der()?;
        Ok(certificate)
    }

    fn install(&self, certificate: &Certificate, scope: StoreScope) -> Result<bool, CertificateError> {
        match self.try_install(certificate, scope) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(subject = certificate.subject(), "Access to the certificate store was denied");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn uninstall(&self, location: &CertificateLocation) -> Result<bool, CertificateError> {
        let Some(cert_path) = self.find(location)? else {
            return Ok(true);
        };

        for path in [cert_path.with_extension("key"), cert_path] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

fn generate_rsa_key(bits: usize) -> Result<KeyPair, CertificateError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CertificateError::KeyGeneration(e.to_string()))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| CertificateError::KeyGeneration(e.to_string()))?;
    KeyPair::from_der(der.as_bytes()).map_err(|e| CertificateError::KeyGeneration(e.to_string()))
}

fn random_serial() -> SerialNumber {
    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    // Positive, and without a leading zero byte so DER keeps all 16 bytes.
    serial[0] = (serial[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&serial)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn set_validity(params: &mut CertificateParams, valid_years: i64) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(365 * valid_years);
}

fn generation_error(e: impl fmt::Display) -> CertificateError {
    CertificateError::Generation(e.to_string())
}

/// Certificate lifecycle on top of a [`CertificateStore`]
pub struct CertificateManager {
    store: Box<dyn CertificateStore>,
    root_key_size: usize,
    domain_key_size: usize,
}

impl CertificateManager {
    pub fn new(store: impl CertificateStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            root_key_size: ROOT_KEY_SIZE,
            domain_key_size: DOMAIN_KEY_SIZE,
        }
    }

    /// Override the RSA key sizes used for new certificates
    pub fn with_key_sizes(mut self, root_key_size: usize, domain_key_size: usize) -> Self {
        self.root_key_size = root_key_size;
        self.domain_key_size = domain_key_size;
        self
    }

    pub fn store(&self) -> &dyn CertificateStore {
        self.store.as_ref()
    }

    /// Create a self-signed certificate authority
    pub fn create_root(
        subject: &str,
        key_size: usize,
        valid_years: i64,
    ) -> Result<Certificate, CertificateError> {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_RSA_SHA256;
        params.key_pair = Some(generate_rsa_key(key_size)?);
        params.distinguished_name = distinguished_name(subject);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());
        set_validity(&mut params, valid_years);

        let cert = rcgen::Certificate::from_params(params).map_err(generation_error)?;
        let cert_pem = cert.serialize_pem().map_err(generation_error)?;
        let key_pem = cert.serialize_private_key_pem();

        info!(subject, key_size, valid_years, "Generated root certificate");
        Ok(Certificate::new(subject, cert_pem, Some(key_pem)))
    }

    /// Create a server certificate for `domains` (plus the loopback address) signed by `issuer`
    pub fn create_signed(
        issuer: &Certificate,
        subject: &str,
        domains: &[String],
        key_size: usize,
        valid_years: i64,
    ) -> Result<Certificate, CertificateError> {
        let issuer_key_pem = issuer
            .key_pem()
            .ok_or_else(|| CertificateError::MissingPrivateKey(issuer.subject().to_string()))?;
        let issuer_key = KeyPair::from_pem(issuer_key_pem).map_err(generation_error)?;
        let issuer_params = CertificateParams::from_ca_cert_pem(issuer.cert_pem(), issuer_key)
            .map_err(generation_error)?;
        let issuer_cert = rcgen::Certificate::from_params(issuer_params).map_err(generation_error)?;

        let mut params = CertificateParams::default();
        params.alg = &PKCS_RSA_SHA256;
        params.key_pair = Some(generate_rsa_key(key_size)?);
        params.distinguished_name = distinguished_name(subject);
        // rcgen marks an explicit cA=false critical; leaf constraints stay non-critical.
        params.is_ca = IsCa::NoCa;
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            OID_BASIC_CONSTRAINTS,
            NOT_CA_BASIC_CONSTRAINTS.to_vec(),
        )];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = domains
            .iter()
            .map(|domain| SanType::DnsName(domain.clone()))
            .collect();
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());
        set_validity(&mut params, valid_years);

        let cert = rcgen::Certificate::from_params(params).map_err(generation_error)?;
        let cert_pem = cert
            .serialize_pem_with_signer(&issuer_cert)
            .map_err(generation_error)?;
        let key_pem = cert.serialize_private_key_pem();

        info!(subject, issuer = issuer.subject(), domains = ?domains, "Generated signed certificate");
        Ok(Certificate::new(subject, cert_pem, Some(key_pem)))
    }

    /// Stored root, or a new one installed in the store.
    /// `None` when the store refused the new certificate.
    pub fn get_or_create_root(&self, subject: &str) -> Result<Option<Certificate>, CertificateError> {
        let location = CertificateLocation::new(subject, StoreScope::Root);

        if self.store.is_installed(&location)? {
            info!(subject, "Certificate already present in the store");
            return self.store.get(&location).map(Some);
        }

        let cert = Self::create_root(subject, self.root_key_size, ROOT_VALID_YEARS)?;
        if !self.store.install(&cert, StoreScope::Root)? {
            error!(subject, "Failed to install the certificate");
            return Ok(None);
        }

        info!(subject, "Certificate created and installed in the store");
        Ok(Some(cert))
    }

    /// Stored root, if any
    pub fn get_root(&self, subject: &str) -> Result<Option<Certificate>, CertificateError> {
        let location = CertificateLocation::new(subject, StoreScope::Root);
        if self.store.is_installed(&location)? {
            self.store.get(&location).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Stored leaf, or a new one signed by `issuer` and kept for the next run
    pub fn get_or_create_signed(
        &self,
        issuer: &Certificate,
        subject: &str,
        domains: &[String],
    ) -> Result<Certificate, CertificateError> {
        let location = CertificateLocation::new(subject, StoreScope::Personal);

        if self.store.is_installed(&location)? {
            info!(subject, "Certificate already present in the store");
            return self.store.get(&location);
        }

        let cert = Self::create_signed(
            issuer,
            subject,
            domains,
            self.domain_key_size,
            DOMAIN_VALID_YEARS,
        )?;
        if self.store.install(&cert, StoreScope::Personal)? {
            info!(subject, "Certificate created and installed in the store");
        } else {
            warn!(subject, "Certificate created but could not be stored, it will be regenerated next run");
        }
        Ok(cert)
    }

    /// Remove a certificate; `true` when it is gone afterwards
    pub fn remove(&self, location: &CertificateLocation) -> Result<bool, CertificateError> {
        if !self.store.is_installed(location)? {
            info!(subject = %location.subject, "Certificate is not present in the store");
            return Ok(true);
        }

        let removed = self.store.uninstall(location)?;
        if removed {
            info!(subject = %location.subject, "Certificate removed from the store");
        } else {
            error!(subject = %location.subject, "Cannot remove the certificate");
        }
        Ok(removed)
    }
}

/// TLS server configuration presenting `domain` and its issuing `root`
pub fn server_config(domain: &Certificate, root: &Certificate) -> Result<ServerConfig, CertificateError> {
    let chain = vec![domain.cert_der()?, root.cert_der()?];
    let config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(chain, domain.private_key_der()?)?;
    Ok(config)
}

/// TLS client configuration trusting the webpki roots plus `extra_roots`
pub fn client_config(extra_roots: &[Certificate]) -> Result<ClientConfig, CertificateError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for root in extra_roots {
        roots.add(root.cert_der()?)?;
    }

    Ok(ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_root_certificates(roots)
    .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::oid_registry::OID_PKCS1_SHA256WITHRSA;
    use x509_parser::prelude::X509Certificate;

    const TEST_KEY_SIZE: usize = 2048;

    fn test_root() -> Certificate {
        CertificateManager::create_root("Test Root CA", TEST_KEY_SIZE, 1).unwrap()
    }

    fn parsed<'a>(der: &'a CertificateDer<'static>) -> X509Certificate<'a> {
        let (rest, cert) = x509_parser::parse_x509_certificate(der.as_ref()).unwrap();
        assert!(rest.is_empty());
        cert
    }

    #[test]
    fn test_root_certificate_profile() {
        let root = test_root();
        let der = root.cert_der().unwrap();
        let cert = parsed(&der);

        assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
        assert_eq!(cert.signature_algorithm.algorithm, OID_PKCS1_SHA256WITHRSA);
        assert_eq!(cert.raw_serial().len(), 16);

        let constraints = cert.basic_constraints().unwrap().unwrap();
        assert!(constraints.critical);
        assert!(constraints.value.ca);
        assert_eq!(constraints.value.path_len_constraint, Some(0));

        let usage = cert.key_usage().unwrap().unwrap().value;
        assert!(usage.key_cert_sign());
        assert!(usage.crl_sign());
        assert!(!usage.digital_signature());

        assert!(cert.extended_key_usage().unwrap().unwrap().value.server_auth);
    }

    #[test]
    fn test_signed_certificate_profile() {
        let root = test_root();
        let domains = vec!["local.test".to_string(), "api.local.test".to_string()];
        let leaf = CertificateManager::create_signed(&root, "Test Domains", &domains, TEST_KEY_SIZE, 1)
            .unwrap();
        let root_der = root.cert_der().unwrap();
        let leaf_der = leaf.cert_der().unwrap();
        let issuer = parsed(&root_der);
        let cert = parsed(&leaf_der);

        assert_eq!(cert.issuer().to_string(), issuer.subject().to_string());
        assert_eq!(cert.signature_algorithm.algorithm, OID_PKCS1_SHA256WITHRSA);
        assert_eq!(cert.raw_serial().len(), 16);
        assert_ne!(cert.raw_serial(), issuer.raw_serial());

        let constraints = cert.basic_constraints().unwrap().unwrap();
        assert!(!constraints.critical);
        assert!(!constraints.value.ca);
        assert_eq!(constraints.value.path_len_constraint, None);

        let usage = cert.key_usage().unwrap().unwrap().value;
        assert!(usage.digital_signature());
        assert!(usage.key_encipherment());
        assert!(!usage.key_cert_sign());

        assert!(cert.extended_key_usage().unwrap().unwrap().value.server_auth);

        let names = &cert.subject_alternative_name().unwrap().unwrap().value.general_names;
        assert!(names.contains(&GeneralName::DNSName("local.test")));
        assert!(names.contains(&GeneralName::DNSName("api.local.test")));
        assert!(names.contains(&GeneralName::IPAddress(&[127, 0, 0, 1])));
        assert_eq!(names.len(), 3);

        let has_authority_key_id = cert
            .extensions()
            .iter()
            .any(|ext| matches!(ext.parsed_extension(), ParsedExtension::AuthorityKeyIdentifier(_)));
        assert!(has_authority_key_id);
    }

    #[test]
    fn test_create_root() {
        let root = test_root();
        assert!(root.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(root.has_private_key());
        assert!(root.cert_der().is_ok());
        assert!(root.private_key_der().is_ok());
    }

    #[test]
    fn test_create_signed_and_server_config() {
        let root = test_root();
        let domains = vec!["local.test".to_string(), "api.local.test".to_string()];
        let leaf = CertificateManager::create_signed(&root, "Test Domains", &domains, TEST_KEY_SIZE, 1)
            .unwrap();
        assert_ne!(leaf.cert_pem(), root.cert_pem());
        assert!(server_config(&leaf, &root).is_ok());
        assert!(client_config(&[root]).is_ok());
    }

    #[test]
    fn test_create_signed_requires_issuer_key() {
        let root = test_root();
        let public_only = Certificate::new("Test Root CA", root.cert_pem().to_string(), None);
        let result = CertificateManager::create_signed(&public_only, "x", &[], TEST_KEY_SIZE, 1);
        assert!(matches!(result, Err(CertificateError::MissingPrivateKey(_))));
    }

    #[test]
    fn test_file_store_lifecycle() {
        let dir = tempdir().unwrap();
        let store = FileCertificateStore::new(dir.path()).unwrap();
        let location = CertificateLocation::new("Test Root CA", StoreScope::Root);

        assert!(!store.is_installed(&location).unwrap());
        assert!(store.install(&test_root(), StoreScope::Root).unwrap());
        assert!(dir.path().join("root").join("test-root-ca.crt").exists());

        // Lookup is a case-insensitive subject substring match.
        assert!(store.is_installed(&CertificateLocation::new("ROOT", StoreScope::Root)).unwrap());
        assert!(!store.is_installed(&CertificateLocation::new("Test Root CA", StoreScope::Personal)).unwrap());

        let loaded = store.get(&location).unwrap();
        assert!(loaded.has_private_key());

        assert!(store.uninstall(&location).unwrap());
        assert!(!store.is_installed(&location).unwrap());
        assert!(store.uninstall(&location).unwrap());
    }

    #[test]
    fn test_file_store_missing_private_key() {
        let dir = tempdir().unwrap();
        let store = FileCertificateStore::new(dir.path()).unwrap();
        let root = test_root();
        let public_only = Certificate::new(root.subject(), root.cert_pem().to_string(), None);
        assert!(store.install(&public_only, StoreScope::Root).unwrap());

        let result = store.get(&CertificateLocation::new(root.subject(), StoreScope::Root));
        assert!(matches!(result, Err(CertificateError::MissingPrivateKey(_))));
    }

    #[test]
    fn test_manager_reuses_stored_certificates() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(FileCertificateStore::new(dir.path()).unwrap())
            .with_key_sizes(TEST_KEY_SIZE, TEST_KEY_SIZE);

        assert!(manager.get_root(ROOT_SUBJECT).unwrap().is_none());
        let root = manager.get_or_create_root(ROOT_SUBJECT).unwrap().unwrap();
        let again = manager.get_or_create_root(ROOT_SUBJECT).unwrap().unwrap();
        assert_eq!(root.cert_pem(), again.cert_pem());

        let domains = vec!["local.test".to_string()];
        let leaf = manager.get_or_create_signed(&root, DOMAIN_SUBJECT, &domains).unwrap();
        let leaf_again = manager.get_or_create_signed(&root, DOMAIN_SUBJECT, &domains).unwrap();
        assert_eq!(leaf.cert_pem(), leaf_again.cert_pem());

        assert!(manager.remove(&CertificateLocation::root()).unwrap());
        assert!(manager.remove(&CertificateLocation::root()).unwrap());
        assert!(manager.get_root(ROOT_SUBJECT).unwrap().is_none());
        assert!(manager.store().is_installed(&CertificateLocation::domain()).unwrap());
    }

    #[test]
    fn test_sanitize_subject() {
        assert_eq!(
            FileCertificateStore::sanitize_subject("SnapTunnel Secure Certificate Authority"),
            "snaptunnel-secure-certificate-authority"
        );
        assert_eq!(FileCertificateStore::sanitize_subject("*.example.com"), "w-example-com");
    }
}
