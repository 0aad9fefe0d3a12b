use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::crypto::{KeyError, PublicKey};

/// PEM tag for certificates
pub const CERTIFICATE_TAG: &str = "CERTIFICATE";

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),
    #[error("failed to build certificate: {0}")]
    Build(String),
    #[error("certificate is missing its {0}")]
    MissingField(&'static str),
    #[error("unknown certificate type: {0}")]
    UnknownType(String),
    #[error("credentials hold no certificate")]
    MissingCertificate,
    #[error("certificate does not match the credential key")]
    KeyMismatch,
    #[error("failed to parse PEM: {0}")]
    Pem(#[from] pem::PemError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// Role tag carried in every certificate's subject
///
/// Fixed at issuance. Authorization decisions (who may publish host
/// configuration, accept enrollments, relay) key off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateType {
    Root,
    User,
    Server,
    Agent,
}

impl CertificateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateType::Root => "root",
            CertificateType::User => "user",
            CertificateType::Server => "server",
            CertificateType::Agent => "agent",
        }
    }

    /// Root and user certificates sign others
    pub fn is_authority(&self) -> bool {
        matches!(self, CertificateType::Root | CertificateType::User)
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateType {
    type Err = CertificateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(CertificateType::Root),
            "user" => Ok(CertificateType::User),
            "server" => Ok(CertificateType::Server),
            "agent" => Ok(CertificateType::Agent),
            other => Err(CertificateError::UnknownType(other.to_string())),
        }
    }
}

/// An X.509 certificate plus the fields the trust core reads from it
///
/// The DER bytes are authoritative; everything else is decoded once at
/// construction. Two certificates are equal only if their DER is equal.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    name: String,
    kind: CertificateType,
    public_key: PublicKey,
    not_before: i64,
    not_after: i64,
    is_ca: bool,
    subject: String,
    issuer: String,
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("key", &self.public_key.fingerprint())
            .finish()
    }
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, CertificateError> {
    let (rest, cert) =
        X509Certificate::from_der(der).map_err(|e| CertificateError::Parse(e.to_string()))?;
    if !rest.is_empty() {
        return Err(CertificateError::Parse("trailing bytes after certificate".into()));
    }
    Ok(cert)
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let cert = parse(der)?;
        let subject = cert.subject();

        let name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or(CertificateError::MissingField("common name"))?
            .to_string();
        let kind = subject
            .iter_organizational_unit()
            .next()
            .and_then(|ou| ou.as_str().ok())
            .ok_or(CertificateError::MissingField("type tag"))?
            .parse()?;
        let public_key = PublicKey::from_der(cert.public_key().raw)?;

        Ok(Self {
            name,
            kind,
            public_key,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            is_ca: cert.is_ca(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            der: der.to_vec(),
        })
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, CertificateError> {
        let pem = pem::parse(pem_str)?;
        if pem.tag() != CERTIFICATE_TAG {
            return Err(CertificateError::Parse(format!(
                "expected PEM tag {CERTIFICATE_TAG}, got {}",
                pem.tag()
            )));
        }
        Self::from_der(pem.contents())
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(CERTIFICATE_TAG, self.der.clone()))
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject common name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CertificateType {
        self.kind
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Fingerprint of the subject key (not of the certificate)
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }

    /// Hex SHA-256 of the certificate DER
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Check that `issuer` names and signed this certificate
    pub fn verify_issued_by(&self, issuer: &Certificate) -> Result<(), CertificateError> {
        if !issuer.is_ca {
            return Err(CertificateError::Parse(format!(
                "{} is not a certificate authority",
                issuer.name
            )));
        }
        if self.issuer != issuer.subject {
            return Err(CertificateError::Parse(format!(
                "issued by {}, not {}",
                self.issuer, issuer.subject
            )));
        }
        let cert = parse(&self.der)?;
        let issuer_cert = parse(&issuer.der)?;
        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|e| CertificateError::Parse(format!("bad issuer signature: {e}")))
    }
}

impl Serialize for Certificate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.der)
    }
}

impl<'de> Deserialize<'de> for Certificate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        Certificate::from_der(&bytes).map_err(serde::de::Error::custom)
    }
}
