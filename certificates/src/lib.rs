// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Certificate lifecycle for the warden node monitor: validation of
//! certificate/key material supplied by operators and peers, plus the
//! [`manager::CertificateManager`] that generates, signs, renews and stages
//! the per-role certificates of a node.

use openssl::asn1::Asn1Time;
use openssl::pkey::PKey;
use openssl::x509::X509;

pub mod manager;

pub use manager::CertificateManager;

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate")]
    BadCertificate(#[source] openssl::error::ErrorStack),

    #[error("Certificate exists, but is empty")]
    CertificateEmpty,

    #[error("Certificate exists, but is expired")]
    CertificateExpired,

    #[error("Failed to parse private key")]
    BadPrivateKey(#[source] openssl::error::ErrorStack),

    #[error("Certificate and private key do not match")]
    KeyCertMismatch,

    #[error("Certificate does not match hostname {0:?}")]
    NoDnsNameMatchingHostname(String),

    #[error("Unsupported certificate purpose (not usable for server auth)")]
    UnsupportedPurpose,

    #[error("Unexpected error")]
    Unexpected(#[source] openssl::error::ErrorStack),
}

/// Validates a PEM certificate chain against its private key and intended
/// use.
pub struct CertificateValidator {
    validate_expiration: bool,
}

impl Default for CertificateValidator {
    fn default() -> Self {
        Self { validate_expiration: true }
    }
}

impl CertificateValidator {
    /// Disable validation of certificate expiration dates.
    ///
    /// This exists to support basic certificate validation even before time
    /// is available (e.g., on an installer node whose clock has not been
    /// synchronized yet), and backs the agent's `--insecure` dev mode.
    pub fn danger_disable_expiration_validation(&mut self) {
        self.validate_expiration = false;
    }

    /// Validate that we can parse the cert chain, that the key matches, and
    /// that the certs in the chain are not expired (unless we have disabled
    /// expiration validation).
    ///
    /// `certs` is expected to be a certificate chain in PEM format.
    ///
    /// `key` is expected to be the private key for the leaf certificate of
    /// `certs` in PEM format.
    ///
    /// If `hostname` is not `None`, the leaf certificate of `certs` must be
    /// valid for `hostname`, as determined by a dNSName entry in its subject
    /// alternate names or (if there are no dNSName SANs) the cert's common
    /// name.
    pub fn validate(
        &self,
        certs: &[u8],
        key: &[u8],
        hostname: Option<&str>,
    ) -> Result<(), CertificateError> {
        // Checks on the certs themselves.
        let mut certs = X509::stack_from_pem(certs)
            .map_err(CertificateError::BadCertificate)?;
        if certs.is_empty() {
            return Err(CertificateError::CertificateEmpty);
        }

        if self.validate_expiration {
            let now = Asn1Time::days_from_now(0)
                .map_err(CertificateError::Unexpected)?;
            for cert in &certs {
                if cert.not_after() < now {
                    return Err(CertificateError::CertificateExpired);
                }
            }
        }

        // Extract the first certificate in the chain (the leaf certificate)
        // to use with verifying the private key.
        let cert = certs.swap_remove(0);
        let cert_der =
            cert.to_der().map_err(CertificateError::BadCertificate)?;

        if let Some(hostname) = hostname {
            if !cert_valid_for_hostname(&cert_der, hostname) {
                return Err(CertificateError::NoDnsNameMatchingHostname(
                    hostname.to_string(),
                ));
            }

            // A certificate named for a host is one we'll hand to a web
            // server; check the x509 extended attributes say it can serve.
            validate_cert_der_extended_key_usage(&cert_der)?;
        }

        // Checks on the private key.
        let key = PKey::private_key_from_pem(key)
            .map_err(CertificateError::BadPrivateKey)?;

        // Verify the public key corresponding to this private key
        // matches the public key in the certificate.
        if !cert
            .public_key()
            .map_err(CertificateError::BadCertificate)?
            .public_eq(&key)
        {
            return Err(CertificateError::KeyCertMismatch);
        }

        Ok(())
    }
}

// The openssl crate does not expose hostname checking, so we re-parse the
// leaf via the pure Rust x509-parser crate and walk the names ourselves.
// dNSName SANs are authoritative when present; the common name is only a
// fallback for SAN-less certificates.
fn cert_valid_for_hostname(der: &[u8], hostname: &str) -> bool {
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::FromDer;

    let Ok((_, cert)) = x509_parser::certificate::X509Certificate::from_der(der)
    else {
        return false;
    };

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        let mut saw_dns_name = false;
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns_name) = name {
                saw_dns_name = true;
                if dns_name_matches(dns_name, hostname) {
                    return true;
                }
            }
        }
        if saw_dns_name {
            return false;
        }
    }

    let matched = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| dns_name_matches(cn, hostname));
    matched
}

// Wildcard rules per RFC 6125: a leading `*.` label matches exactly one
// label of the presented hostname.
fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if pattern == hostname {
            // "*.x.y" presented as a literal hostname.
            return true;
        }
        match hostname.split_once('.') {
            Some((first_label, rest)) => {
                !first_label.is_empty() && rest == suffix
            }
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(hostname)
    }
}

// This helper only fails if we successfully parse the extensions we want
// _and_ they fail to satisfy the requirements for a TLS server certificate;
// we err on the side of allowing the cert.
fn validate_cert_der_extended_key_usage(
    der: &[u8],
) -> Result<(), CertificateError> {
    use x509_parser::certificate::X509CertificateParser;
    use x509_parser::nom::Parser;

    let mut parser = X509CertificateParser::new();
    let Ok((_remaining, cert)) = parser.parse(der) else {
        return Ok(());
    };

    if let Ok(Some(key_usage)) = cert.key_usage() {
        // If we have the Key Usage extension, we must have at least one of
        // the digitalSignature / keyEncipherment bits set.
        if !key_usage.value.digital_signature()
            && !key_usage.value.key_encipherment()
        {
            return Err(CertificateError::UnsupportedPurpose);
        }
    }

    if let Ok(Some(ext_key_usage)) = cert.extended_key_usage() {
        // If we have the Extended Key Usage extension, we must have either
        // the server auth bit or "any".
        if !ext_key_usage.value.any && !ext_key_usage.value.server_auth {
            return Err(CertificateError::UnsupportedPurpose);
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_chain {
    //! Utility structure for making a test certificate chain.

    pub struct CertificateChain {
        root_keypair: rcgen::Certificate,
        root_cert: Vec<u8>,
        intermediate_cert: Vec<u8>,
        end_cert: Vec<u8>,
        end_keypair: rcgen::Certificate,
    }

    impl CertificateChain {
        pub fn new<S: Into<String>>(subject_alt_name: S) -> Self {
            let params =
                rcgen::CertificateParams::new(vec![subject_alt_name.into()]);
            Self::with_params(params)
        }

        pub fn with_params(params: rcgen::CertificateParams) -> Self {
            let mut root_params = rcgen::CertificateParams::new(vec![]);
            root_params.is_ca =
                rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            let root_keypair = rcgen::Certificate::from_params(root_params)
                .expect("failed to generate root keys");

            let mut intermediate_params = rcgen::CertificateParams::new(vec![]);
            intermediate_params.is_ca =
                rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            let intermediate_keypair =
                rcgen::Certificate::from_params(intermediate_params)
                    .expect("failed to generate intermediate keys");

            let end_keypair = rcgen::Certificate::from_params(params)
                .expect("failed to generate end-entity keys");

            let root_cert = root_keypair
                .serialize_der()
                .expect("failed to serialize root cert");
            let intermediate_cert = intermediate_keypair
                .serialize_der_with_signer(&root_keypair)
                .expect("failed to serialize intermediate cert");
            let end_cert = end_keypair
                .serialize_der_with_signer(&intermediate_keypair)
                .expect("failed to serialize end-entity cert");

            Self {
                root_keypair,
                root_cert,
                intermediate_cert,
                end_cert,
                end_keypair,
            }
        }

        pub fn end_cert_private_key_as_pem(&self) -> String {
            self.end_keypair.serialize_private_key_pem()
        }

        pub fn root_private_key_as_pem(&self) -> String {
            self.root_keypair.serialize_private_key_pem()
        }

        pub fn root_cert_as_pem(&self) -> String {
            der_to_pem(&self.root_cert)
        }

        pub fn cert_chain_as_pem(&self) -> String {
            [&self.end_cert, &self.intermediate_cert, &self.root_cert]
                .into_iter()
                .map(|der| der_to_pem(der))
                .collect()
        }
    }

    fn der_to_pem(der: &[u8]) -> String {
        pem::encode(&pem::Pem {
            tag: "CERTIFICATE".to_string(),
            contents: der.to_vec(),
        })
    }
}
