//! Issues the self-signed CA and the CA-signed serving certificates that secure aggregated API services

use std::sync::Arc;

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509NameBuilder, X509Ref, X509VerifyResult, X509,
    },
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;

use crate::{
    crd::ClusterServiceVersion,
    utils::{asn1time_to_offsetdatetime, Asn1TimeParseError, FmtByteSlice},
};

mod clock;

pub use clock::{Clock, SystemClock};
#[cfg(test)]
pub use clock::FixedClock;

/// Default lifetime of both the CA and the serving certificates.
pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_days_unchecked(2 * 365);

/// Certificates are reissued once less than this is left of their lifetime.
pub const DEFAULT_CERT_MIN_FRESH: Duration = Duration::from_hours_unchecked(24);

pub const DEFAULT_ORGANIZATION: &str = "Stackable GmbH";

/// Certificates are backdated slightly to tolerate clock skew between nodes.
const NOT_BEFORE_BACKDATE: Duration = Duration::from_minutes_unchecked(5);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build {tpe:?} certificate"))]
    BuildCertificate {
        source: openssl::error::ErrorStack,
        tpe: CertType,
    },

    #[snafu(display("failed to serialize {tpe:?} certificate"))]
    SerializeCertificate {
        source: openssl::error::ErrorStack,
        tpe: CertType,
    },

    #[snafu(display("serving certificate requires at least one host"))]
    NoHosts,

    #[snafu(display("failed to decode PEM certificate"))]
    DecodeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to read certificate lifetime"))]
    ReadLifetime { source: Asn1TimeParseError },

    #[snafu(display("failed to check certificate signature"))]
    CheckSignature { source: openssl::error::ErrorStack },

    #[snafu(display("certificate was not issued by the CA: {reason}"))]
    NotIssuedByCa { reason: String },

    #[snafu(display("certificate signature does not match the CA key"))]
    InvalidSignature,

    #[snafu(display("certificate is not valid for host {host:?}"))]
    HostMismatch { host: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the certificate itself failed to chain to the CA or match the host,
    /// as opposed to the check not being able to run at all.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Error::NotIssuedByCa { .. } | Error::InvalidSignature | Error::HostMismatch { .. }
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CertType {
    Ca,
    Serving,
}

/// Lifetime and subject settings shared by every certificate issued in a reconciliation pass.
#[derive(Clone, Debug)]
pub struct CertConfig {
    pub validity: Duration,
    pub min_fresh: Duration,
    pub organization: String,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            validity: DEFAULT_CERT_VALIDITY,
            min_fresh: DEFAULT_CERT_MIN_FRESH,
            organization: DEFAULT_ORGANIZATION.to_string(),
        }
    }
}

/// A certificate together with its private key.
pub struct KeyPair {
    pub cert: X509,
    pub key: PKey<Private>,
    not_after: OffsetDateTime,
    tpe: CertType,
}

impl KeyPair {
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// PEM-encodes the certificate and its PKCS#8 private key, in that order.
    pub fn to_pem(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let tpe = self.tpe;
        Ok((
            self.cert
                .to_pem()
                .context(SerializeCertificateSnafu { tpe })?,
            self.key
                .private_key_to_pem_pkcs8()
                .context(SerializeCertificateSnafu { tpe })?,
        ))
    }
}

/// Issues certificates, reading the current time from an injected [`Clock`].
#[derive(Clone)]
pub struct Issuer {
    clock: Arc<dyn Clock>,
    config: CertConfig,
}

impl Issuer {
    pub fn new(clock: Arc<dyn Clock>, config: CertConfig) -> Self {
        Self { clock, config }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn config(&self) -> &CertConfig {
        &self.config
    }

    /// The `notAfter` of certificates issued right now.
    pub fn expiration(&self) -> OffsetDateTime {
        cert_expiration(self.now(), &self.config)
    }

    pub fn rotates_at(&self, expiration: OffsetDateTime) -> OffsetDateTime {
        cert_rotates_at(expiration, &self.config)
    }

    pub fn generate_ca(&self, not_after: OffsetDateTime) -> Result<KeyPair> {
        generate_ca(self.now(), not_after, &self.config.organization)
    }

    pub fn create_signed_serving_pair(
        &self,
        not_after: OffsetDateTime,
        ca: &KeyPair,
        hosts: &[String],
    ) -> Result<KeyPair> {
        create_signed_serving_pair(self.now(), not_after, &self.config.organization, ca, hosts)
    }

    pub fn active(&self, cert: &X509Ref) -> bool {
        active(cert, self.now())
    }
}

pub fn cert_expiration(now: OffsetDateTime, config: &CertConfig) -> OffsetDateTime {
    now + config.validity
}

pub fn cert_rotates_at(expiration: OffsetDateTime, config: &CertConfig) -> OffsetDateTime {
    expiration - config.min_fresh
}

/// Whether the serving certificates of `csv` must be (re)issued.
pub fn should_rotate_certs(csv: &ClusterServiceVersion, now: OffsetDateTime) -> bool {
    if csv.owned_api_services().is_empty() {
        return false;
    }
    if csv
        .certs_last_updated()
        .is_some_and(|last_updated| last_updated > now)
    {
        return true;
    }
    match csv.certs_rotate_at() {
        Some(rotate_at) => now >= rotate_at,
        None => true,
    }
}

fn random_serial() -> Result<Asn1Integer, openssl::error::ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    Asn1Integer::from_bn(&serial)
}

fn generate_key() -> Result<PKey<Private>> {
    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
        .and_then(|group| EcKey::generate(&group))
        .and_then(PKey::from_ec_key)
        .context(GenerateKeySnafu)
}

/// Generates a self-signed CA valid until `not_after`.
pub fn generate_ca(
    now: OffsetDateTime,
    not_after: OffsetDateTime,
    organization: &str,
) -> Result<KeyPair> {
    let tpe = CertType::Ca;
    let not_before = now - NOT_BEFORE_BACKDATE;
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu { tpe })?;
    let ca_key = generate_key()?;
    let subject_name = X509NameBuilder::new()
        .and_then(|mut name| {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
            name.append_entry_by_nid(Nid::COMMONNAME, "apiservice-operator self-signed")?;
            Ok(name)
        })
        .context(BuildCertificateSnafu { tpe })?
        .build();
    let ca_cert = X509Builder::new()
        .and_then(|mut x509| {
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(&subject_name)?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&ca_key)?;
            x509.set_serial_number(random_serial()?.as_ref())?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            let ctx = x509.x509v3_context(None, Some(&conf));
            let exts = [
                BasicConstraints::new().critical().ca().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(false)
                    .keyid(false)
                    .build(&ctx)?,
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_cert_sign()
                    .build()?,
                ExtendedKeyUsage::new()
                    .client_auth()
                    .server_auth()
                    .build()?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&ca_key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu { tpe })?
        .build();
    Ok(KeyPair {
        cert: ca_cert,
        key: ca_key,
        not_after,
        tpe,
    })
}

/// Issues a serving certificate for `hosts`, signed by `ca` and valid until `not_after`.
pub fn create_signed_serving_pair(
    now: OffsetDateTime,
    not_after: OffsetDateTime,
    organization: &str,
    ca: &KeyPair,
    hosts: &[String],
) -> Result<KeyPair> {
    let tpe = CertType::Serving;
    let common_name = hosts.first().context(NoHostsSnafu)?;
    let not_before = now - NOT_BEFORE_BACKDATE;
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu { tpe })?;
    let key = generate_key()?;
    let cert = X509Builder::new()
        .and_then(|mut x509| {
            let subject_name = X509NameBuilder::new()
                .and_then(|mut name| {
                    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
                    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
                    Ok(name)
                })?
                .build();
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(ca.cert.subject_name())?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&key)?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            x509.set_serial_number(random_serial()?.as_ref())?;
            let ctx = x509.x509v3_context(Some(&ca.cert), Some(&conf));
            let mut san_ext = SubjectAlternativeName::new();
            for host in hosts {
                san_ext.dns(host);
            }
            let exts = [
                BasicConstraints::new().critical().build()?,
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
                ExtendedKeyUsage::new()
                    .server_auth()
                    .client_auth()
                    .build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(true)
                    .keyid(true)
                    .build(&ctx)?,
                san_ext.build(&ctx)?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&ca.key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu { tpe })?
        .build();
    Ok(KeyPair {
        cert,
        key,
        not_after,
        tpe,
    })
}

pub fn pem_to_cert(pem: &[u8]) -> Result<X509> {
    X509::from_pem(pem).context(DecodeCertificateSnafu)
}

/// Hex-encoded SHA-256 digest of `pem`, used to detect CA drift between objects.
pub fn pem_sha256(pem: &[u8]) -> String {
    format!("{:x}", FmtByteSlice(&openssl::sha::sha256(pem)))
}

/// Whether `now` lies within the validity period of `cert`.
pub fn active(cert: &X509Ref, now: OffsetDateTime) -> bool {
    match (
        asn1time_to_offsetdatetime(cert.not_before()),
        asn1time_to_offsetdatetime(cert.not_after()),
    ) {
        (Ok(not_before), Ok(not_after)) => not_before <= now && now <= not_after,
        _ => false,
    }
}

/// Checks that `cert` was signed by `ca` and is valid for `host`.
///
/// Validity periods are deliberately not considered here, see [`active`].
pub fn verify_cert(ca: &X509Ref, cert: &X509Ref, host: &str) -> Result<()> {
    let issued = ca.issued(cert);
    ensure!(
        issued == X509VerifyResult::OK,
        NotIssuedByCaSnafu {
            reason: issued.error_string()
        }
    );
    let ca_key = ca.public_key().context(CheckSignatureSnafu)?;
    ensure!(
        cert.verify(&ca_key).context(CheckSignatureSnafu)?,
        InvalidSignatureSnafu
    );
    let matches_host = cert.subject_alt_names().is_some_and(|sans| {
        sans.iter()
            .filter_map(|san| san.dnsname())
            .any(|pattern| host_matches(pattern, host))
    });
    ensure!(matches_host, HostMismatchSnafu { host });
    Ok(())
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let host = host.trim_end_matches('.');
    match pattern.strip_prefix("*.") {
        // Wildcards only ever cover a single leftmost label
        Some(suffix) => host
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest.eq_ignore_ascii_case(suffix)),
        None => pattern.eq_ignore_ascii_case(host),
    }
}

/// Reads the `notAfter` of `cert`.
pub fn not_after(cert: &X509Ref) -> Result<OffsetDateTime> {
    asn1time_to_offsetdatetime(cert.not_after()).context(ReadLifetimeSnafu)
}

#[cfg(test)]
mod tests {
    use stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use time::macros::datetime;

    use super::*;
    use crate::{
        crd::{ApiServiceDescription, ClusterServiceVersionSpec, ClusterServiceVersionStatus},
        utils::offsetdatetime_to_k8s_time,
    };

    const NOW: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    fn hosts() -> Vec<String> {
        vec![
            "a1-service.operators".to_string(),
            "a1-service.operators.svc".to_string(),
        ]
    }

    fn ca_and_leaf() -> (KeyPair, KeyPair) {
        let config = CertConfig::default();
        let not_after = cert_expiration(NOW, &config);
        let ca = generate_ca(NOW, not_after, DEFAULT_ORGANIZATION).unwrap();
        let leaf =
            create_signed_serving_pair(NOW, not_after, DEFAULT_ORGANIZATION, &ca, &hosts())
                .unwrap();
        (ca, leaf)
    }

    #[test]
    fn pem_round_trip() {
        let (ca, leaf) = ca_and_leaf();
        let (cert_pem, key_pem) = leaf.to_pem().unwrap();
        assert!(String::from_utf8(key_pem).unwrap().contains("PRIVATE KEY"));
        let decoded = pem_to_cert(&cert_pem).unwrap();
        assert_eq!(decoded.to_der().unwrap(), leaf.cert.to_der().unwrap());
        assert_eq!(not_after(&decoded).unwrap(), leaf.not_after());

        let (ca_pem, _) = ca.to_pem().unwrap();
        assert_eq!(
            pem_to_cert(&ca_pem).unwrap().to_der().unwrap(),
            ca.cert.to_der().unwrap()
        );
    }

    #[test]
    fn malformed_pem_is_rejected() {
        assert!(matches!(
            pem_to_cert(b"-----BEGIN CERTIFICATE-----\nnope\n-----END CERTIFICATE-----\n"),
            Err(Error::DecodeCertificate { .. })
        ));
    }

    #[test]
    fn serving_cert_is_trusted_for_its_hosts_only() {
        let (ca, leaf) = ca_and_leaf();
        for host in hosts() {
            verify_cert(&ca.cert, &leaf.cert, &host).unwrap();
        }
        let err = verify_cert(&ca.cert, &leaf.cert, "other-service.operators.svc").unwrap_err();
        assert!(matches!(err, Error::HostMismatch { .. }), "{err}");
        assert!(err.is_trust_failure());
    }

    #[test]
    fn serving_cert_is_not_trusted_by_other_ca() {
        let (_, leaf) = ca_and_leaf();
        let (other_ca, _) = ca_and_leaf();
        let err = verify_cert(&other_ca.cert, &leaf.cert, &hosts()[0]).unwrap_err();
        assert!(err.is_trust_failure(), "{err}");
    }

    #[test]
    fn only_the_ca_may_sign() {
        let (ca, leaf) = ca_and_leaf();
        let ca_constraints = ca.cert.to_text().unwrap();
        let leaf_constraints = leaf.cert.to_text().unwrap();
        assert!(String::from_utf8_lossy(&ca_constraints).contains("CA:TRUE"));
        assert!(String::from_utf8_lossy(&leaf_constraints).contains("CA:FALSE"));
    }

    #[test]
    fn pem_sha256_is_stable() {
        let (ca, leaf) = ca_and_leaf();
        let (ca_pem, _) = ca.to_pem().unwrap();
        let (leaf_pem, _) = leaf.to_pem().unwrap();
        assert_eq!(pem_sha256(&ca_pem), pem_sha256(&ca_pem));
        assert_ne!(pem_sha256(&ca_pem), pem_sha256(&leaf_pem));
        assert_eq!(
            pem_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn active_window() {
        let (ca, _) = ca_and_leaf();
        assert!(active(&ca.cert, NOW));
        assert!(active(&ca.cert, NOW - Duration::from_minutes_unchecked(1)));
        assert!(!active(&ca.cert, NOW - Duration::from_hours_unchecked(1)));
        assert!(!active(
            &ca.cert,
            ca.not_after() + Duration::from_minutes_unchecked(1)
        ));
    }

    #[test]
    fn rotation_deadline() {
        let config = CertConfig::default();
        let expiration = cert_expiration(NOW, &config);
        assert_eq!(expiration, datetime!(2026-03-01 12:00 UTC));
        assert_eq!(
            cert_rotates_at(expiration, &config),
            datetime!(2026-02-28 12:00 UTC)
        );
    }

    #[test]
    fn wildcard_hosts() {
        assert!(host_matches("*.operators.svc", "a1.operators.svc"));
        assert!(!host_matches("*.operators.svc", "a.b.operators.svc"));
        assert!(!host_matches("*.operators.svc", "operators.svc"));
        assert!(host_matches("A1.Operators", "a1.operators"));
    }

    fn csv_with_status(status: ClusterServiceVersionStatus) -> ClusterServiceVersion {
        let mut csv = ClusterServiceVersion::new("csv1", ClusterServiceVersionSpec::default());
        csv.spec.apiservicedefinitions.owned.push(ApiServiceDescription {
            group: "a1".to_string(),
            version: "v1".to_string(),
            kind: "a1Kind".to_string(),
            deployment_name: "a1".to_string(),
            ..Default::default()
        });
        csv.status = Some(status);
        csv
    }

    fn time(dt: OffsetDateTime) -> Option<Time> {
        Some(offsetdatetime_to_k8s_time(dt).unwrap())
    }

    #[test]
    fn rotation_decision() {
        assert!(should_rotate_certs(
            &csv_with_status(ClusterServiceVersionStatus::default()),
            NOW
        ));
        let fresh = csv_with_status(ClusterServiceVersionStatus {
            certs_last_updated: time(NOW - Duration::from_days_unchecked(1)),
            certs_rotate_at: time(NOW + Duration::from_days_unchecked(1)),
            ..Default::default()
        });
        assert!(!should_rotate_certs(&fresh, NOW));
        assert!(should_rotate_certs(
            &fresh,
            NOW + Duration::from_days_unchecked(1)
        ));
        let from_the_future = csv_with_status(ClusterServiceVersionStatus {
            certs_last_updated: time(NOW + Duration::from_days_unchecked(1)),
            certs_rotate_at: time(NOW + Duration::from_days_unchecked(2)),
            ..Default::default()
        });
        assert!(should_rotate_certs(&from_the_future, NOW));

        let mut no_api_services = fresh;
        no_api_services.spec.apiservicedefinitions.owned.clear();
        no_api_services.status = None;
        assert!(!should_rotate_certs(&no_api_services, NOW));
    }
}
