//! Certificate issuance
//!
//! Root and user credentials act as certificate authorities. Certificates
//! are built with `rcgen`; the subject's role goes in the OU and its name
//! in the CN of the distinguished name.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, SubjectPublicKeyInfo,
};
use time::OffsetDateTime;

use crate::crypto::{PublicKey, SecretKey};

use super::certificate::{Certificate, CertificateError, CertificateType};
use super::credentials::Credentials;
use super::error::PkiError;

/// Backdating applied to `not_before` to absorb clock skew between nodes
const CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

fn distinguished_name(name: &str, kind: CertificateType) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn.push(DnType::OrganizationalUnitName, kind.as_str());
    dn
}

fn build_params(
    name: &str,
    kind: CertificateType,
    validity: Duration,
) -> Result<CertificateParams, CertificateError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(name, kind);

    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - CLOCK_SKEW;
    params.not_after = now + validity;

    if kind.is_authority() {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
    } else {
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    }
    Ok(params)
}

fn rcgen_key(key: &SecretKey) -> Result<KeyPair, PkiError> {
    let pem = key.to_pkcs8_pem()?;
    KeyPair::from_pem(&pem).map_err(|e| CertificateError::Build(e.to_string()).into())
}

/// Create a fresh self-signed root and return it as permanent credentials
pub fn create_root(name: &str, validity: Duration) -> Result<Credentials, PkiError> {
    let key = SecretKey::generate();
    let key_pair = rcgen_key(&key)?;
    let cert = build_params(name, CertificateType::Root, validity)?
        .self_signed(&key_pair)
        .map_err(|e| CertificateError::Build(e.to_string()))?;
    let certificate = Certificate::from_der(cert.der())?;
    tracing::info!(name, key = %certificate.fingerprint(), "created root certificate");
    Credentials::new(certificate, key)
}

/// Roles a given authority may hand out
fn may_issue(issuer: CertificateType, subject: CertificateType) -> bool {
    match issuer {
        CertificateType::Root => subject != CertificateType::Root,
        CertificateType::User => {
            matches!(subject, CertificateType::Server | CertificateType::Agent)
        }
        _ => false,
    }
}

/// Issue a certificate for `subject` signed by `issuer`
///
/// Roots issue users, servers and agents; users issue servers and agents.
pub fn issue(
    issuer: &Credentials,
    subject: &PublicKey,
    name: &str,
    kind: CertificateType,
    validity: Duration,
) -> Result<Certificate, PkiError> {
    let issuer_cert = issuer.certificate()?;
    if !may_issue(issuer_cert.kind(), kind) {
        return Err(PkiError::PermissionDenied(format!(
            "a {} certificate may not issue a {} certificate",
            issuer_cert.kind(),
            kind
        )));
    }

    // rcgen needs the issuer as one of its own certificates; rebuilding it
    // from the same name and key reproduces the subject DN the child names.
    let issuer_key = rcgen_key(issuer.secret_key())?;
    let issuer_rcgen = build_params(issuer_cert.name(), issuer_cert.kind(), validity)?
        .self_signed(&issuer_key)
        .map_err(|e| CertificateError::Build(e.to_string()))?;

    let subject_key = SubjectPublicKeyInfo::from_der(subject.to_der())
        .map_err(|e| CertificateError::Build(e.to_string()))?;
    let cert = build_params(name, kind, validity)?
        .signed_by(&subject_key, &issuer_rcgen, &issuer_key)
        .map_err(|e| CertificateError::Build(e.to_string()))?;

    let certificate = Certificate::from_der(cert.der())?;
    tracing::debug!(
        name,
        kind = %kind,
        issuer = %issuer_cert.name(),
        key = %certificate.fingerprint(),
        "issued certificate"
    );
    Ok(certificate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn user_may_issue_devices_only() {
        let root = create_root("acme", DAY).unwrap();
        let user_key = SecretKey::generate();
        let user_cert =
            issue(&root, &user_key.public(), "admin", CertificateType::User, DAY).unwrap();
        let user = Credentials::new(user_cert.clone(), user_key).unwrap();

        let server = issue(
            &user,
            &SecretKey::generate().public(),
            "server",
            CertificateType::Server,
            DAY,
        )
        .unwrap();
        assert!(server.verify_issued_by(&user_cert).is_ok());

        let denied = issue(
            &user,
            &SecretKey::generate().public(),
            "other-admin",
            CertificateType::User,
            DAY,
        );
        assert!(matches!(denied, Err(PkiError::PermissionDenied(_))));
    }

    #[test]
    fn leaves_cannot_issue() {
        let root = create_root("acme", DAY).unwrap();
        let agent_key = SecretKey::generate();
        let agent_cert =
            issue(&root, &agent_key.public(), "host", CertificateType::Agent, DAY).unwrap();
        let agent = Credentials::new(agent_cert, agent_key).unwrap();

        let result = issue(
            &agent,
            &SecretKey::generate().public(),
            "host-2",
            CertificateType::Agent,
            DAY,
        );
        assert!(matches!(result, Err(PkiError::PermissionDenied(_))));
    }
}
