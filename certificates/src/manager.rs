// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The certificate manager owns the PKI material of a node: it generates key
//! pairs and CSRs per role, signs CSRs when this node holds signing
//! authority, tracks expirations, and decides what needs renewal.
//!
//! Certificates are never mutated in place. Renewal writes a new dated
//! artifact to the identity store and the previous version is superseded by
//! the key convention (most recent timestamp wins). The manager also keeps
//! the invariant that at most one CSR per role is pending at a time; this is
//! the concurrency guard for renewal, not a lock.

use crate::{CertificateError, CertificateValidator};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use idstore::{
    ArtifactKey, ArtifactKind, IdentityStore, StoreError, PKI_PREFIX,
    SECRETS_PREFIX,
};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{
    X509, X509Extension, X509NameBuilder, X509Ref, X509Req, X509ReqBuilder,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use slog::{debug, o, warn, Logger};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;
use warden_common::cluster::Role;

/// Leaf certificate validity.
const LEAF_VALIDITY_DAYS: u32 = 90;
/// Intermediate CA validity.
const INTERMEDIATE_VALIDITY_DAYS: u32 = 730;
/// Root CA validity.
const ROOT_VALIDITY_DAYS: u32 = 3650;

const ORGANIZATION: &str = "warden";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no signing authority: missing {issuer} key material")]
    IssuerKeyMissing { issuer: Role },

    #[error("CSR for {role} failed signature verification")]
    BadCsr { role: Role },

    #[error("no pending CSR for {role}")]
    NoPendingCsr { role: Role },

    #[error("certificate for {role} has an expiration outside representable time")]
    InvalidTime { role: Role },

    #[error("OpenSSL failure while {context}")]
    Ssl {
        context: &'static str,
        #[source]
        err: ErrorStack,
    },

    #[error("I/O error accessing {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] CertificateError),
}

fn ssl(context: &'static str) -> impl FnOnce(ErrorStack) -> Error {
    move |err| Error::Ssl { context, err }
}

/// A certificate chain plus its metadata, as handled by the manager.
#[derive(Clone, Debug)]
pub struct CertificateArtifact {
    pub role: Role,
    pub chain_pem: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    /// Private key PEM, if this node holds it (absent when only the public
    /// half was distributed to us).
    pub key_pem: Option<Vec<u8>>,
    /// Creation time; also the version suffix of the store key.
    pub created: DateTime<Utc>,
}

/// A CSR that has been generated but not yet resolved into a certificate.
#[derive(Clone, Debug)]
pub struct PendingCsr {
    pub role: Role,
    pub csr_pem: Vec<u8>,
    /// Key PEM as persisted (possibly passphrase-encrypted).
    pub key_pem: Vec<u8>,
    /// Set when the CSR has been submitted to a signer.
    pub correlation_id: Option<Uuid>,
    pub created: DateTime<Utc>,
}

/// Loaded signing material for an authority role.
pub struct SigningAuthority {
    pub role: Role,
    cert: X509,
    key: PKey<Private>,
    chain_pem: Vec<u8>,
}

/// Roles whose private keys are stored passphrase-encrypted, with the
/// passphrase persisted as a password artifact for the service account.
fn role_uses_password(role: Role) -> bool {
    matches!(role, Role::Messaging | Role::Datastore)
}

fn issuer_for(role: Role) -> Role {
    match role {
        Role::Intermediate => Role::Root,
        _ => Role::Intermediate,
    }
}

fn validity_days(role: Role) -> u32 {
    match role {
        Role::Root => ROOT_VALIDITY_DAYS,
        Role::Intermediate => INTERMEDIATE_VALIDITY_DAYS,
        _ => LEAF_VALIDITY_DAYS,
    }
}

pub struct CertificateManager {
    log: Logger,
    store: Arc<dyn IdentityStore>,
    staging: Utf8PathBuf,
    hostname: String,
    validator: CertificateValidator,
    pending: Mutex<BTreeMap<Role, PendingCsr>>,
}

impl CertificateManager {
    pub fn new(
        log: &Logger,
        store: Arc<dyn IdentityStore>,
        staging: Utf8PathBuf,
        hostname: String,
        insecure: bool,
    ) -> CertificateManager {
        let mut validator = CertificateValidator::default();
        if insecure {
            validator.danger_disable_expiration_validation();
        }
        CertificateManager {
            log: log.new(o!("component" => "CertificateManager")),
            store,
            staging,
            hostname,
            validator,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn validator(&self) -> &CertificateValidator {
        &self.validator
    }

    /// Generate a key pair and CSR for `role`, persisting both to the
    /// identity store.
    ///
    /// At most one CSR per role may be pending; calling this again for the
    /// same role discards the previous request (its store keys included).
    pub async fn generate_csr(
        &self,
        role: Role,
        with_password: bool,
    ) -> Result<PendingCsr, Error> {
        let key = generate_key()?;
        let req = build_csr(&key, role, &self.hostname)?;
        let csr_pem = req.to_pem().map_err(ssl("serializing CSR"))?;

        let created = Utc::now();
        let key_pem = if with_password {
            let passphrase = generate_password();
            self.store
                .put_artifact(
                    &ArtifactKey::stamped(
                        SECRETS_PREFIX,
                        role,
                        ArtifactKind::Password,
                        created,
                    ),
                    passphrase.as_bytes(),
                )
                .await?;
            key.private_key_to_pem_pkcs8_passphrase(
                Cipher::aes_256_cbc(),
                passphrase.as_bytes(),
            )
            .map_err(ssl("encrypting private key"))?
        } else {
            key.private_key_to_pem_pkcs8()
                .map_err(ssl("serializing private key"))?
        };

        // Retire any superseded request for this role before persisting the
        // new one.
        self.store.delete_all(PKI_PREFIX, role, ArtifactKind::Csr).await?;
        self.store
            .put_artifact(
                &ArtifactKey::stamped(PKI_PREFIX, role, ArtifactKind::Key, created),
                &key_pem,
            )
            .await?;
        self.store
            .put_artifact(
                &ArtifactKey::stamped(PKI_PREFIX, role, ArtifactKind::Csr, created),
                &csr_pem,
            )
            .await?;

        let pending = PendingCsr {
            role,
            csr_pem,
            key_pem,
            correlation_id: None,
            created,
        };
        self.pending.lock().await.insert(role, pending.clone());
        debug!(self.log, "generated CSR"; "role" => %role);
        Ok(pending)
    }

    /// The live pending CSR for `role`, if any.
    pub async fn pending_csr(&self, role: Role) -> Option<PendingCsr> {
        self.pending.lock().await.get(&role).cloned()
    }

    /// Record that the pending CSR for `role` was submitted under
    /// `correlation_id`.
    pub async fn mark_submitted(
        &self,
        role: Role,
        correlation_id: Uuid,
    ) -> Result<(), Error> {
        let mut pending = self.pending.lock().await;
        let csr =
            pending.get_mut(&role).ok_or(Error::NoPendingCsr { role })?;
        csr.correlation_id = Some(correlation_id);
        Ok(())
    }

    /// Load the signing material for an authority role from the identity
    /// store.
    pub async fn signing_authority(
        &self,
        issuer: Role,
    ) -> Result<SigningAuthority, Error> {
        let missing = |err: StoreError| {
            if err.is_not_found() {
                Error::IssuerKeyMissing { issuer }
            } else {
                Error::Store(err)
            }
        };
        let cert_artifact = self
            .store
            .current_artifact(PKI_PREFIX, issuer, ArtifactKind::Cert)
            .await
            .map_err(missing)?;
        let key_artifact = self
            .store
            .current_artifact(PKI_PREFIX, issuer, ArtifactKind::Key)
            .await
            .map_err(missing)?;
        SigningAuthority::from_pem(issuer, &cert_artifact.bytes, &key_artifact.bytes)
    }

    /// Issue a certificate chain for `role` from `csr_pem`, signed by
    /// `authority`.
    ///
    /// Pure issuance: the result is not persisted (see
    /// [`Self::store_certificate`]).
    pub fn sign_csr(
        &self,
        role: Role,
        csr_pem: &[u8],
        authority: &SigningAuthority,
    ) -> Result<CertificateArtifact, Error> {
        self.sign_csr_inner(
            role,
            csr_pem,
            authority,
            validity_days(role),
            &self.hostname,
        )
    }

    /// Like [`Self::sign_csr`], but naming a peer's hostname in the issued
    /// certificate (the principal signing a dependent's batch).
    pub fn sign_csr_for_host(
        &self,
        role: Role,
        csr_pem: &[u8],
        authority: &SigningAuthority,
        hostname: &str,
    ) -> Result<CertificateArtifact, Error> {
        self.sign_csr_inner(
            role,
            csr_pem,
            authority,
            validity_days(role),
            hostname,
        )
    }

    #[cfg(test)]
    pub(crate) fn sign_csr_with_days(
        &self,
        role: Role,
        csr_pem: &[u8],
        authority: &SigningAuthority,
        days: u32,
    ) -> Result<CertificateArtifact, Error> {
        self.sign_csr_inner(role, csr_pem, authority, days, &self.hostname)
    }

    fn sign_csr_inner(
        &self,
        role: Role,
        csr_pem: &[u8],
        authority: &SigningAuthority,
        days: u32,
        san: &str,
    ) -> Result<CertificateArtifact, Error> {
        let req = X509Req::from_pem(csr_pem).map_err(ssl("parsing CSR"))?;
        let req_key =
            req.public_key().map_err(ssl("reading CSR public key"))?;
        if !req.verify(&req_key).map_err(ssl("verifying CSR"))? {
            return Err(Error::BadCsr { role });
        }

        let cert = issue_from_csr(
            &req,
            &authority.cert,
            &authority.key,
            days,
            role.is_authority(),
            Some(san),
        )
        .map_err(ssl("issuing certificate"))?;

        let mut chain_pem =
            cert.to_pem().map_err(ssl("serializing certificate"))?;
        chain_pem.extend_from_slice(&authority.chain_pem);

        let expires_at = asn1_to_datetime(cert.not_after())
            .map_err(|_| Error::InvalidTime { role })?;
        Ok(CertificateArtifact {
            role,
            chain_pem,
            expires_at,
            key_pem: None,
            created: Utc::now(),
        })
    }

    /// Persist an issued certificate as the new current artifact for its
    /// role, retiring any spent CSR keys and the pending request.
    pub async fn store_certificate(
        &self,
        artifact: &CertificateArtifact,
    ) -> Result<ArtifactKey, Error> {
        let key = ArtifactKey::stamped(
            PKI_PREFIX,
            artifact.role,
            ArtifactKind::Cert,
            artifact.created,
        );
        self.store.put_artifact(&key, &artifact.chain_pem).await?;
        if let Some(key_pem) = &artifact.key_pem {
            self.store
                .put_artifact(
                    &ArtifactKey::stamped(
                        PKI_PREFIX,
                        artifact.role,
                        ArtifactKind::Key,
                        artifact.created,
                    ),
                    key_pem,
                )
                .await?;
        }
        // CSR keys are not retained once the certificate exists.
        self.store
            .delete_all(PKI_PREFIX, artifact.role, ArtifactKind::Csr)
            .await?;
        self.pending.lock().await.remove(&artifact.role);
        Ok(key)
    }

    /// Accept a certificate chain signed elsewhere (by the principal node)
    /// for a role whose key we generated locally.
    ///
    /// The chain must match our stored private key; on
    /// [`CertificateError::KeyCertMismatch`] nothing is persisted.
    pub async fn adopt_certificate(
        &self,
        role: Role,
        chain_pem: &[u8],
    ) -> Result<CertificateArtifact, Error> {
        let key_pem = self.role_key_pem_decrypted(role).await?;
        self.validator.validate(chain_pem, &key_pem, None)?;

        let expires_at = leaf_expiration(chain_pem, role)?;
        let artifact = CertificateArtifact {
            role,
            chain_pem: chain_pem.to_vec(),
            expires_at,
            key_pem: None,
            created: Utc::now(),
        };
        self.store_certificate(&artifact).await?;
        Ok(artifact)
    }

    /// Validate and persist a certificate/key bundle obtained from an
    /// external authority (the installer's domain-validation flow).
    ///
    /// On [`CertificateError::KeyCertMismatch`] nothing is persisted.
    pub async fn store_external_bundle(
        &self,
        role: Role,
        chain_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<CertificateArtifact, Error> {
        self.validator.validate(chain_pem, key_pem, None)?;
        let expires_at = leaf_expiration(chain_pem, role)?;
        let artifact = CertificateArtifact {
            role,
            chain_pem: chain_pem.to_vec(),
            expires_at,
            key_pem: Some(key_pem.to_vec()),
            created: Utc::now(),
        };
        self.store_certificate(&artifact).await?;
        Ok(artifact)
    }

    /// Persist a certificate whose private key we never hold (the cluster
    /// root of trust, whose key stays with the operator).
    pub async fn store_trust_anchor(
        &self,
        role: Role,
        chain_pem: &[u8],
    ) -> Result<CertificateArtifact, Error> {
        let expires_at = leaf_expiration(chain_pem, role)?;
        let artifact = CertificateArtifact {
            role,
            chain_pem: chain_pem.to_vec(),
            expires_at,
            key_pem: None,
            created: Utc::now(),
        };
        self.store_certificate(&artifact).await?;
        Ok(artifact)
    }

    /// Self-sign a brand-new root of trust, persisting certificate and key.
    pub async fn bootstrap_root(&self) -> Result<CertificateArtifact, Error> {
        let key = generate_key()?;
        let cert = issue_self_signed_ca(
            &key,
            "warden root ca",
            ROOT_VALIDITY_DAYS,
        )
        .map_err(ssl("self-signing root certificate"))?;

        let chain_pem =
            cert.to_pem().map_err(ssl("serializing root certificate"))?;
        let key_pem = key
            .private_key_to_pem_pkcs8()
            .map_err(ssl("serializing root key"))?;
        let expires_at = asn1_to_datetime(cert.not_after())
            .map_err(|_| Error::InvalidTime { role: Role::Root })?;

        let artifact = CertificateArtifact {
            role: Role::Root,
            chain_pem,
            expires_at,
            key_pem: Some(key_pem),
            created: Utc::now(),
        };
        self.store_certificate(&artifact).await?;
        Ok(artifact)
    }

    /// The subset of `required` roles with no usable current certificate.
    pub async fn missing_roles(
        &self,
        required: &[Role],
    ) -> Result<Vec<Role>, Error> {
        let mut missing = Vec::new();
        for &role in required {
            if self.current_expiration(role).await?.is_none() {
                missing.push(role);
            }
        }
        Ok(missing)
    }

    /// Expiration of the current certificate for `role`; `None` when the
    /// artifact is absent or malformed (a malformed stored certificate is
    /// logged and treated as missing, never fatal).
    pub async fn current_expiration(
        &self,
        role: Role,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let artifact = match self
            .store
            .current_artifact(PKI_PREFIX, role, ArtifactKind::Cert)
            .await
        {
            Ok(artifact) => artifact,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match leaf_expiration(&artifact.bytes, role) {
            Ok(expires_at) => Ok(Some(expires_at)),
            Err(_) => {
                warn!(
                    self.log,
                    "stored certificate is malformed; treating as missing";
                    "role" => %role,
                    "key" => %artifact.key,
                );
                Ok(None)
            }
        }
    }

    /// Inspect every role in `roles` and renew the ones whose certificate
    /// is absent or expires within `horizon`. Returns the roles actually
    /// renewed.
    ///
    /// Idempotent: a second call in the same cycle renews nothing.
    pub async fn scan_and_renew(
        &self,
        roles: &[Role],
        horizon: Duration,
    ) -> Result<Vec<Role>, Error> {
        let horizon = chrono::Duration::from_std(horizon)
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        let now = Utc::now();
        let mut renewed = Vec::new();
        for &role in roles {
            let needs_renewal = match self.current_expiration(role).await? {
                None => true,
                Some(expires_at) => expires_at - now < horizon,
            };
            if !needs_renewal {
                continue;
            }
            let authority = self.signing_authority(issuer_for(role)).await?;
            let pending =
                self.generate_csr(role, role_uses_password(role)).await?;
            let artifact =
                self.sign_csr(role, &pending.csr_pem, &authority)?;
            self.store_certificate(&artifact).await?;
            debug!(self.log, "renewed certificate"; "role" => %role);
            renewed.push(role);
        }
        Ok(renewed)
    }

    /// Materialize every current certificate (and key, where held) for
    /// `roles` into the private staging directory, for handing to dependent
    /// connection clients. Always safe to call repeatedly.
    pub async fn load_all(&self, roles: &[Role]) -> Result<(), Error> {
        std::fs::create_dir_all(&self.staging).map_err(|err| Error::Io {
            path: self.staging.clone(),
            err,
        })?;
        for &role in roles {
            let cert = match self
                .store
                .current_artifact(PKI_PREFIX, role, ArtifactKind::Cert)
                .await
            {
                Ok(artifact) => artifact,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            write_private_file(
                &self.staging.join(format!("{}.cert.pem", role)),
                &cert.bytes,
            )?;
            match self
                .store
                .current_artifact(PKI_PREFIX, role, ArtifactKind::Key)
                .await
            {
                Ok(key) => write_private_file(
                    &self.staging.join(format!("{}.key.pem", role)),
                    &key.bytes,
                )?,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Delete the locally staged key/cert material. Part of the shutdown
    /// discipline; missing staging is not an error.
    pub fn clear_staging(&self) -> Result<(), Error> {
        match std::fs::remove_dir_all(&self.staging) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(Error::Io { path: self.staging.clone(), err })
            }
        }
    }

    // The current private key for `role`, decrypted if it was stored under a
    // passphrase.
    async fn role_key_pem_decrypted(&self, role: Role) -> Result<Vec<u8>, Error> {
        let key_artifact = self
            .store
            .current_artifact(PKI_PREFIX, role, ArtifactKind::Key)
            .await?;
        let key = if pem_is_encrypted(&key_artifact.bytes) {
            let passphrase = self
                .store
                .current_artifact(SECRETS_PREFIX, role, ArtifactKind::Password)
                .await?;
            PKey::private_key_from_pem_passphrase(
                &key_artifact.bytes,
                &passphrase.bytes,
            )
            .map_err(CertificateError::BadPrivateKey)?
        } else {
            PKey::private_key_from_pem(&key_artifact.bytes)
                .map_err(CertificateError::BadPrivateKey)?
        };
        key.private_key_to_pem_pkcs8()
            .map_err(ssl("re-serializing private key"))
    }
}

impl SigningAuthority {
    pub fn from_pem(
        role: Role,
        chain_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<SigningAuthority, Error> {
        let mut certs = X509::stack_from_pem(chain_pem)
            .map_err(CertificateError::BadCertificate)?;
        if certs.is_empty() {
            return Err(CertificateError::CertificateEmpty.into());
        }
        let cert = certs.swap_remove(0);
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(CertificateError::BadPrivateKey)?;
        if !cert
            .public_key()
            .map_err(CertificateError::BadCertificate)?
            .public_eq(&key)
        {
            return Err(CertificateError::KeyCertMismatch.into());
        }
        Ok(SigningAuthority {
            role,
            cert,
            key,
            chain_pem: chain_pem.to_vec(),
        })
    }
}

/// Hex SHA-256 fingerprint of the first certificate in a PEM chain. The
/// cluster id is the fingerprint of the cluster's root certificate.
pub fn fingerprint(chain_pem: &[u8]) -> Result<String, Error> {
    let certs = X509::stack_from_pem(chain_pem)
        .map_err(CertificateError::BadCertificate)?;
    let cert = certs.first().ok_or(CertificateError::CertificateEmpty)?;
    let digest = cert
        .digest(MessageDigest::sha256())
        .map_err(ssl("fingerprinting certificate"))?;
    Ok(hex::encode(digest))
}

/// A generated service-account password.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

fn generate_key() -> Result<PKey<Private>, Error> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
        .map_err(ssl("loading P-256 group"))?;
    let ec = EcKey::generate(&group).map_err(ssl("generating key pair"))?;
    PKey::from_ec_key(ec).map_err(ssl("wrapping key pair"))
}

fn build_csr(
    key: &PKey<Private>,
    role: Role,
    hostname: &str,
) -> Result<X509Req, Error> {
    let build = || -> Result<X509Req, ErrorStack> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", role.as_str())?;
        name.append_entry_by_text("O", ORGANIZATION)?;
        let name = name.build();

        let mut req = X509ReqBuilder::new()?;
        req.set_version(0)?;
        req.set_subject_name(&name)?;
        req.set_pubkey(key)?;

        let mut exts: Stack<X509Extension> = Stack::new()?;
        {
            let ctx = req.x509v3_context(None);
            exts.push(
                SubjectAlternativeName::new().dns(hostname).build(&ctx)?,
            )?;
        }
        req.add_extensions(&exts)?;
        req.sign(key, MessageDigest::sha256())?;
        Ok(req.build())
    };
    build().map_err(ssl("building CSR"))
}

fn issue_from_csr(
    req: &X509Req,
    issuer_cert: &X509,
    issuer_key: &PKey<Private>,
    days: u32,
    is_ca: bool,
    san: Option<&str>,
) -> Result<X509, ErrorStack> {
    let issuer_ref: &X509Ref = issuer_cert;
    let mut builder = X509::builder()?;
    builder.set_version(2)?;

    let serial = {
        let mut bn = BigNum::new()?;
        bn.rand(64, MsbOption::MAYBE_ZERO, false)?;
        bn.to_asn1_integer()?
    };
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(req.subject_name())?;
    builder.set_issuer_name(issuer_cert.subject_name())?;
    let pubkey = req.public_key()?;
    builder.set_pubkey(&pubkey)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    if is_ca {
        builder.append_extension(
            BasicConstraints::new().critical().ca().build()?,
        )?;
        builder.append_extension(
            KeyUsage::new().critical().key_cert_sign().crl_sign().build()?,
        )?;
    } else {
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(
            ExtendedKeyUsage::new().server_auth().client_auth().build()?,
        )?;
        if let Some(hostname) = san {
            let ext = {
                let ctx = builder.x509v3_context(Some(issuer_ref), None);
                SubjectAlternativeName::new().dns(hostname).build(&ctx)?
            };
            builder.append_extension(ext)?;
        }
    }

    let ski = {
        let ctx = builder.x509v3_context(Some(issuer_ref), None);
        SubjectKeyIdentifier::new().build(&ctx)?
    };
    builder.append_extension(ski)?;

    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn issue_self_signed_ca(
    key: &PKey<Private>,
    common_name: &str,
    days: u32,
) -> Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    name.append_entry_by_text("O", ORGANIZATION)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = {
        let mut bn = BigNum::new()?;
        bn.rand(64, MsbOption::MAYBE_ZERO, false)?;
        bn.to_asn1_integer()?
    };
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder
        .append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new().critical().key_cert_sign().crl_sign().build()?,
    )?;
    let ski = {
        let ctx = builder.x509v3_context(None, None);
        SubjectKeyIdentifier::new().build(&ctx)?
    };
    builder.append_extension(ski)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn leaf_expiration(chain_pem: &[u8], role: Role) -> Result<DateTime<Utc>, Error> {
    let certs = X509::stack_from_pem(chain_pem)
        .map_err(CertificateError::BadCertificate)?;
    let leaf = certs.first().ok_or(CertificateError::CertificateEmpty)?;
    asn1_to_datetime(leaf.not_after())
        .map_err(|_| Error::InvalidTime { role })
}

fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>, ()> {
    let epoch = Asn1Time::from_unix(0).map_err(|_| ())?;
    let diff = epoch.diff(time).map_err(|_| ())?;
    let secs = i64::from(diff.days) * 86400 + i64::from(diff.secs);
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or(())
}

// Passphrase-protected keys are serialized as PKCS#8 `ENCRYPTED PRIVATE
// KEY` blocks; trying to parse one without a passphrase would invoke
// OpenSSL's interactive prompt, so sniff the tag instead.
fn pem_is_encrypted(pem: &[u8]) -> bool {
    pem.windows(b"ENCRYPTED".len()).any(|window| window == b"ENCRYPTED")
}

fn write_private_file(path: &Utf8Path, contents: &[u8]) -> Result<(), Error> {
    // Readable and writable by the user only.
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| Error::Io { path: path.to_owned(), err })?;
    file.write_all(contents)
        .map_err(|err| Error::Io { path: path.to_owned(), err })
}

#[cfg(test)]
mod tests {
    use super::*;
    use idstore::MemoryStore;
    use slog::Drain;

    fn test_log() -> Logger {
        Logger::root(slog::Discard.fuse(), o!())
    }

    fn manager(
        store: Arc<dyn IdentityStore>,
        staging: Utf8PathBuf,
    ) -> CertificateManager {
        CertificateManager::new(
            &test_log(),
            store,
            staging,
            "node1.cluster.internal".to_string(),
            false,
        )
    }

    async fn bootstrap_authorities(mgr: &CertificateManager) {
        mgr.bootstrap_root().await.unwrap();
        let root = mgr.signing_authority(Role::Root).await.unwrap();
        let pending =
            mgr.generate_csr(Role::Intermediate, false).await.unwrap();
        let intermediate = mgr
            .sign_csr(Role::Intermediate, &pending.csr_pem, &root)
            .unwrap();
        mgr.store_certificate(&intermediate).await.unwrap();
    }

    #[tokio::test]
    async fn csr_round_trip_yields_matching_key_and_cert() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());
        bootstrap_authorities(&mgr).await;

        let pending = mgr.generate_csr(Role::Monitor, false).await.unwrap();
        let authority =
            mgr.signing_authority(Role::Intermediate).await.unwrap();
        let artifact =
            mgr.sign_csr(Role::Monitor, &pending.csr_pem, &authority).unwrap();
        mgr.store_certificate(&artifact).await.unwrap();
        mgr.load_all(&[Role::Monitor]).await.unwrap();

        let chain = std::fs::read(staging.path().join("monitor.cert.pem"))
            .expect("staged certificate");
        let key = std::fs::read(staging.path().join("monitor.key.pem"))
            .expect("staged key");
        CertificateValidator::default()
            .validate(&chain, &key, Some("node1.cluster.internal"))
            .expect("issued chain does not match generated key");

        // The spent CSR key must be gone from the store.
        let keys = store.list_keys(PKI_PREFIX).await.unwrap();
        assert!(
            !keys.iter().any(|k| k.kind == ArtifactKind::Csr
                && k.role == Role::Monitor),
            "spent CSR still present: {:?}",
            keys
        );
    }

    #[tokio::test]
    async fn scan_and_renew_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());
        bootstrap_authorities(&mgr).await;

        let horizon = Duration::from_secs(30 * 86400);
        let renewed = mgr
            .scan_and_renew(&[Role::Monitor, Role::Web], horizon)
            .await
            .unwrap();
        assert_eq!(renewed, vec![Role::Monitor, Role::Web]);

        let keys_before = store.list_keys(PKI_PREFIX).await.unwrap();
        let renewed = mgr
            .scan_and_renew(&[Role::Monitor, Role::Web], horizon)
            .await
            .unwrap();
        assert!(renewed.is_empty(), "second scan renewed {:?}", renewed);
        let keys_after = store.list_keys(PKI_PREFIX).await.unwrap();
        assert_eq!(keys_before, keys_after, "second scan created artifacts");
    }

    #[tokio::test]
    async fn scan_renews_exactly_the_expiring_roles() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());
        bootstrap_authorities(&mgr).await;

        // Monitor gets a standard 90-day certificate, web a 1-day one.
        let authority =
            mgr.signing_authority(Role::Intermediate).await.unwrap();
        let pending = mgr.generate_csr(Role::Monitor, false).await.unwrap();
        let artifact = mgr
            .sign_csr(Role::Monitor, &pending.csr_pem, &authority)
            .unwrap();
        mgr.store_certificate(&artifact).await.unwrap();

        let pending = mgr.generate_csr(Role::Web, false).await.unwrap();
        let artifact = mgr
            .sign_csr_with_days(Role::Web, &pending.csr_pem, &authority, 1)
            .unwrap();
        mgr.store_certificate(&artifact).await.unwrap();

        let monitor_key_before = store
            .current_artifact(PKI_PREFIX, Role::Monitor, ArtifactKind::Cert)
            .await
            .unwrap()
            .key;

        let horizon = Duration::from_secs(30 * 86400);
        let renewed = mgr
            .scan_and_renew(&[Role::Monitor, Role::Web], horizon)
            .await
            .unwrap();
        assert_eq!(renewed, vec![Role::Web]);

        // The untouched role keeps its timestamp suffix.
        let monitor_key_after = store
            .current_artifact(PKI_PREFIX, Role::Monitor, ArtifactKind::Cert)
            .await
            .unwrap()
            .key;
        assert_eq!(monitor_key_before, monitor_key_after);
    }

    #[tokio::test]
    async fn malformed_stored_certificate_forces_renewal() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());
        bootstrap_authorities(&mgr).await;

        let key = ArtifactKey::stamped(
            PKI_PREFIX,
            Role::Web,
            ArtifactKind::Cert,
            Utc::now(),
        );
        store.put_artifact(&key, b"not a certificate").await.unwrap();

        let renewed = mgr
            .scan_and_renew(&[Role::Web], Duration::from_secs(86400))
            .await
            .unwrap();
        assert_eq!(renewed, vec![Role::Web]);
    }

    #[tokio::test]
    async fn password_protected_key_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());

        let pending =
            mgr.generate_csr(Role::Messaging, true).await.unwrap();
        let passphrase = store
            .current_artifact(
                SECRETS_PREFIX,
                Role::Messaging,
                ArtifactKind::Password,
            )
            .await
            .expect("password artifact")
            .bytes;

        // The stored key is a PKCS#8 encrypted block, readable with the
        // stored passphrase.
        assert!(pem_is_encrypted(&pending.key_pem));
        PKey::private_key_from_pem_passphrase(&pending.key_pem, &passphrase)
            .expect("decrypting key with stored passphrase");
    }

    #[tokio::test]
    async fn second_csr_supersedes_the_first() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());

        let first = mgr.generate_csr(Role::Monitor, false).await.unwrap();
        let second = mgr.generate_csr(Role::Monitor, false).await.unwrap();
        assert_ne!(first.csr_pem, second.csr_pem);

        // Only one CSR key remains in the store and the pending request is
        // the second one.
        let csr_keys: Vec<_> = store
            .list_keys(PKI_PREFIX)
            .await
            .unwrap()
            .into_iter()
            .filter(|k| k.kind == ArtifactKind::Csr)
            .collect();
        assert_eq!(csr_keys.len(), 1);
        let pending = mgr.pending_csr(Role::Monitor).await.unwrap();
        assert_eq!(pending.csr_pem, second.csr_pem);
    }

    #[tokio::test]
    async fn fingerprint_is_hex_sha256() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());
        let root = mgr.bootstrap_root().await.unwrap();
        let fp = fingerprint(&root.chain_pem).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn adopt_rejects_a_foreign_chain() {
        let store = Arc::new(MemoryStore::new());
        let staging = camino_tempfile::tempdir().unwrap();
        let mgr = manager(store.clone(), staging.path().to_owned());
        bootstrap_authorities(&mgr).await;

        // Our key for messaging...
        mgr.generate_csr(Role::Messaging, true).await.unwrap();
        // ...but a chain issued for a different key.
        let authority =
            mgr.signing_authority(Role::Intermediate).await.unwrap();
        let other = mgr.generate_csr(Role::Web, false).await.unwrap();
        let foreign = mgr
            .sign_csr(Role::Web, &other.csr_pem, &authority)
            .unwrap();

        let err = mgr
            .adopt_certificate(Role::Messaging, &foreign.chain_pem)
            .await
            .unwrap_err();
        match err {
            Error::Validation(CertificateError::KeyCertMismatch) => {}
            other => panic!("expected KeyCertMismatch, got {:?}", other),
        }
        // Nothing persisted for messaging.
        assert!(store
            .current_artifact(PKI_PREFIX, Role::Messaging, ArtifactKind::Cert)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
