//! The certificate authority engine
//!
//! Runs in its own process: it owns the trust anchors, CRLs, local
//! certificates and private keys, computes CERTREQ hints, validates
//! peer chains and produces AUTH signatures. Private keys never leave
//! this module; the IKEv2 engine only ever sees requests and verdicts
//! carried over IPC.

use std::collections::HashMap;
use std::path::Path;

use ed25519_dalek::Verifier as _;
use rsa::pkcs1::DecodeRsaPublicKey as _;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, info, warn};
use x509_parser::oid_registry;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use ikewire::defs::params::AuthMethod;

use crate::config::Config;
use crate::sa::IkeId;
use crate::{Error, Result};

/// Hash algorithm identifiers of the SIGNATURE_HASH_ALGORITHMS notify
/// (RFC 7427); we advertise and accept the SHA-2 family
pub const SIGNATURE_HASHES: [u16; 3] = [2, 3, 4];

/// A request the IKEv2 engine dispatches to the CA process
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum CaRequest {
    /// Validate the peer's certificate against the trust store
    VerifyCert {
        /// SPI pair identifying the parked SA
        sa: (u64, u64),
        /// DER certificate from the CERT payload
        cert: Vec<u8>,
        /// Identity the peer claims
        peer_id: IkeId,
    },
    /// Verify an AUTH signature with the peer's public key
    VerifyAuth {
        /// SPI pair identifying the parked SA
        sa: (u64, u64),
        /// DER certificate or raw key the signature must verify under
        cert: Option<Vec<u8>>,
        /// Identity the peer claims, for the raw-pubkey store
        peer_id: IkeId,
        /// Method from the AUTH payload
        method: AuthMethod,
        /// Octets the peer signed
        octets: Vec<u8>,
        /// The signature
        signature: Vec<u8>,
    },
    /// Produce our AUTH signature
    Sign {
        /// SPI pair identifying the parked SA
        sa: (u64, u64),
        /// Octets to sign
        octets: Vec<u8>,
        /// Peer advertised SHA-2 signature hashes
        peer_sigsha2: bool,
    },
}

/// The CA process' answer, carrying the SA identifier so resumption is
/// an index lookup
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum CaReply {
    /// Certificate chain verdict
    CertVerdict {
        /// SPI pair of the parked SA
        sa: (u64, u64),
        /// Whether the chain is anchored, timely and unrevoked
        valid: bool,
    },
    /// AUTH signature verdict
    AuthVerdict {
        /// SPI pair of the parked SA
        sa: (u64, u64),
        /// Whether the signature verifies
        valid: bool,
    },
    /// Our AUTH material
    Signature {
        /// SPI pair of the parked SA
        sa: (u64, u64),
        /// Method to put into the AUTH payload, or none on refusal
        method: Option<AuthMethod>,
        /// Signature octets (RFC 7427 framed for DigitalSignature)
        signature: Vec<u8>,
        /// Certificate to send along, if any
        cert: Option<Vec<u8>>,
    },
}

enum LocalKey {
    Rsa(rsa::RsaPrivateKey),
    EcdsaP256(p256::ecdsa::SigningKey),
    EcdsaP384(p384::ecdsa::SigningKey),
    Ed25519(Box<ed25519_dalek::SigningKey>),
}

impl LocalKey {
    fn method(&self) -> AuthMethod {
        match self {
            LocalKey::Rsa(_) => AuthMethod::RsaDigitalSignature,
            LocalKey::EcdsaP256(_) => AuthMethod::EcdsaSha256P256,
            LocalKey::EcdsaP384(_) => AuthMethod::EcdsaSha384P384,
            // Ed25519 has no pre-RFC-7427 method; it requires SIG
            LocalKey::Ed25519(_) => AuthMethod::DigitalSignature,
        }
    }
}

/// The stores of the CA process
pub struct CertStore {
    /// Trust anchor DER certificates
    anchors: Vec<Vec<u8>>,
    /// CRLs in DER form
    crls: Vec<Vec<u8>>,
    /// Local end entity certificates in DER form
    certs: Vec<Vec<u8>>,
    /// Raw public keys by the peer identity they belong to
    pubkeys: HashMap<IkeId, Vec<u8>>,
    /// Our signing key, if configured
    key: Option<LocalKey>,
    /// Accept a chain ending in a known intermediate
    partial_chain: bool,
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("anchors", &self.anchors.len())
            .field("crls", &self.crls.len())
            .field("certs", &self.certs.len())
            .field("pubkeys", &self.pubkeys.len())
            .finish()
    }
}

impl CertStore {
    /// An empty store, for tests and the pre-reload state
    pub fn empty() -> Self {
        Self {
            anchors: vec![],
            crls: vec![],
            certs: vec![],
            pubkeys: HashMap::new(),
            key: None,
            partial_chain: false,
        }
    }

    /// Scan the configured directories into a fresh store
    pub fn load(config: &Config) -> Self {
        let mut store = Self::empty();
        store.anchors = read_der_dir(&config.ca_dir);
        store.crls = read_der_dir(&config.crl_dir);
        store.certs = read_der_dir(&config.cert_dir);
        if let Ok(entries) = std::fs::read_dir(&config.pubkey_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Ok(data) = std::fs::read(entry.path()) {
                    // file names double as the identity: a FQDN, or an
                    // address literal
                    let id = match name.parse() {
                        Ok(addr) => IkeId::from_addr(addr),
                        Err(_) => IkeId::Fqdn(name),
                    };
                    store.pubkeys.insert(id, data);
                }
            }
        }
        if let Some(path) = &config.local_cert {
            if let Ok(der) = std::fs::read(path) {
                store.certs.insert(0, der);
            }
        }
        info!(
            anchors = store.anchors.len(),
            crls = store.crls.len(),
            certs = store.certs.len(),
            "certificate store loaded"
        );
        store
    }

    /// Install the private key read from the key file
    pub fn set_key_der(&mut self, der: &[u8]) -> Result<()> {
        use ed25519_dalek::pkcs8::DecodePrivateKey as _;
        use p256::pkcs8::DecodePrivateKey as _;
        use rsa::pkcs8::DecodePrivateKey as _;
        self.key = Some(if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_der(der) {
            LocalKey::Rsa(key)
        } else if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            LocalKey::EcdsaP256(key)
        } else if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(der) {
            LocalKey::EcdsaP384(key)
        } else if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_der(der) {
            LocalKey::Ed25519(Box::new(key))
        } else {
            return Err(Error::Config("unreadable private key".into()));
        });
        Ok(())
    }

    /// Accept chains anchored at a known intermediate
    pub fn set_partial_chain(&mut self, allow: bool) {
        self.partial_chain = allow;
    }

    /// The CERTREQ hint list: concatenated SHA-1 digests of each trust
    /// anchor's SubjectPublicKeyInfo
    pub fn certreq_hints(&self) -> Vec<u8> {
        let mut hints = Vec::with_capacity(self.anchors.len() * 20);
        for anchor in &self.anchors {
            if let Ok((_, cert)) = X509Certificate::from_der(anchor) {
                let spki = cert.tbs_certificate.subject_pki.raw;
                hints.extend_from_slice(&Sha1::digest(spki));
            }
        }
        hints
    }

    /// Handle one request; pure function of the store
    pub fn handle(&self, request: CaRequest) -> CaReply {
        match request {
            CaRequest::VerifyCert { sa, cert, peer_id } => CaReply::CertVerdict {
                sa,
                valid: self.verify_chain(&cert, &peer_id).is_ok(),
            },
            CaRequest::VerifyAuth {
                sa,
                cert,
                peer_id,
                method,
                octets,
                signature,
            } => CaReply::AuthVerdict {
                sa,
                valid: self
                    .verify_auth(cert.as_deref(), &peer_id, method, &octets, &signature)
                    .is_ok(),
            },
            CaRequest::Sign {
                sa,
                octets,
                peer_sigsha2,
            } => match self.sign(&octets, peer_sigsha2) {
                Ok((method, signature)) => CaReply::Signature {
                    sa,
                    method: Some(method),
                    signature,
                    cert: self.certs.first().cloned(),
                },
                Err(e) => {
                    warn!("refusing to sign: {e}");
                    CaReply::Signature {
                        sa,
                        method: None,
                        signature: vec![],
                        cert: None,
                    }
                }
            },
        }
    }

    /// Build and check the peer chain: anchored, inside the validity
    /// window, identity matching and not revoked
    pub fn verify_chain(&self, leaf_der: &[u8], peer_id: &IkeId) -> Result<()> {
        let (_, leaf) =
            X509Certificate::from_der(leaf_der).map_err(|_| Error::Authentication("bad cert"))?;
        if !leaf.validity().is_valid() {
            return Err(Error::Authentication("certificate outside validity window"));
        }
        if !cert_matches_id(&leaf, peer_id) {
            return Err(Error::Authentication("certificate does not carry the identity"));
        }

        // find the issuer among the anchors
        let mut anchored = false;
        for anchor_der in &self.anchors {
            let Ok((_, anchor)) = X509Certificate::from_der(anchor_der) else {
                continue;
            };
            if anchor.subject() != leaf.issuer() || !anchor.validity().is_valid() {
                continue;
            }
            if verify_x509_signature(&leaf, &anchor).is_err() {
                continue;
            }
            if self.is_revoked(&leaf, &anchor) {
                return Err(Error::Authentication("certificate revoked"));
            }
            anchored = true;
            break;
        }
        if !anchored && !(self.partial_chain && self.anchors.is_empty()) {
            return Err(Error::Authentication("certificate chain not anchored"));
        }
        debug!(subject = %leaf.subject(), "peer certificate accepted");
        Ok(())
    }

    fn is_revoked(&self, cert: &X509Certificate, issuer: &X509Certificate) -> bool {
        for crl_der in &self.crls {
            let Ok((_, crl)) = CertificateRevocationList::from_der(crl_der) else {
                continue;
            };
            if crl.issuer() != issuer.subject() {
                continue;
            }
            if crl
                .iter_revoked_certificates()
                .any(|revoked| revoked.raw_serial() == cert.raw_serial())
            {
                return true;
            }
        }
        false
    }

    /// Verify an AUTH signature; `cert` is the peer's certificate, or
    /// absent when a raw public key is on file for the identity
    pub fn verify_auth(
        &self,
        cert: Option<&[u8]>,
        peer_id: &IkeId,
        method: AuthMethod,
        octets: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let spki: Vec<u8> = if let Some(raw) = self.pubkeys.get(peer_id) {
            // a configured raw key always wins over a sent certificate
            raw.clone()
        } else if let Some(der) = cert {
            let (_, parsed) =
                X509Certificate::from_der(der).map_err(|_| Error::Authentication("bad cert"))?;
            parsed.tbs_certificate.subject_pki.raw.to_vec()
        } else {
            return Err(Error::Authentication("no key material for peer"));
        };
        verify_with_spki(&spki, method, octets, signature)
    }

    /// Compute our AUTH signature, upgrading to RFC 7427 when the peer
    /// signalled SHA-2 support. When the peer supports neither SHA-2
    /// nor the method our key provides, authentication is refused; the
    /// engine answers AUTHENTICATION_FAILED instead of downgrading.
    pub fn sign(&self, octets: &[u8], peer_sigsha2: bool) -> Result<(AuthMethod, Vec<u8>)> {
        let key = self
            .key
            .as_ref()
            .ok_or(Error::Authentication("no signing key configured"))?;
        if peer_sigsha2 {
            let (prefix, signature) = match key {
                LocalKey::Rsa(key) => {
                    let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                    (SIG_RSA_SHA256, signer.sign(octets).to_vec())
                }
                LocalKey::EcdsaP256(key) => {
                    let signature: p256::ecdsa::DerSignature = key.sign(octets);
                    (SIG_ECDSA_SHA256, signature.to_vec())
                }
                LocalKey::EcdsaP384(key) => {
                    let signature: p384::ecdsa::DerSignature = key.sign(octets);
                    (SIG_ECDSA_SHA384, signature.to_vec())
                }
                LocalKey::Ed25519(key) => (SIG_ED25519, key.sign(octets).to_bytes().to_vec()),
            };
            let mut framed = Vec::with_capacity(1 + prefix.len() + signature.len());
            framed.push(prefix.len() as u8);
            framed.extend_from_slice(prefix);
            framed.extend_from_slice(&signature);
            return Ok((AuthMethod::DigitalSignature, framed));
        }
        // the legacy methods for peers without RFC 7427
        match key {
            LocalKey::Rsa(key) => {
                // pre-7427 RSA auth is PKCS#1 v1.5 over SHA-1
                let signer = rsa::pkcs1v15::SigningKey::<Sha1>::new(key.clone());
                let signature = signer.sign(octets);
                Ok((AuthMethod::RsaDigitalSignature, signature.to_vec()))
            }
            LocalKey::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature = key.sign(octets);
                Ok((AuthMethod::EcdsaSha256P256, signature.to_vec()))
            }
            LocalKey::EcdsaP384(key) => {
                let signature: p384::ecdsa::Signature = key.sign(octets);
                Ok((AuthMethod::EcdsaSha384P384, signature.to_vec()))
            }
            LocalKey::Ed25519(_) => Err(Error::Authentication(
                "peer lacks SHA-2 signatures, refusing to downgrade",
            )),
        }
    }
}

// DER AlgorithmIdentifier prefixes of the RFC 7427 signature framing
const SIG_RSA_SHA256: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b, 0x05, 0x00,
];
const SIG_ECDSA_SHA256: &[u8] = &[0x30, 0x0a, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
const SIG_ECDSA_SHA384: &[u8] = &[0x30, 0x0a, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x03];
const SIG_ED25519: &[u8] = &[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70];

/// Verify a signature in one of the AUTH methods under a DER
/// SubjectPublicKeyInfo
fn verify_with_spki(
    spki_der: &[u8],
    method: AuthMethod,
    octets: &[u8],
    signature: &[u8],
) -> Result<()> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|_| Error::Authentication("bad public key"))?;
    let key_bytes = &spki.subject_public_key.data;

    match method {
        AuthMethod::RsaDigitalSignature => {
            let key = rsa::RsaPublicKey::from_pkcs1_der(key_bytes)
                .map_err(|_| Error::Authentication("bad RSA key"))?;
            let verifier = rsa::pkcs1v15::VerifyingKey::<Sha1>::new(key);
            verifier
                .verify(
                    octets,
                    &rsa::pkcs1v15::Signature::try_from(signature)
                        .map_err(|_| Error::Authentication("bad signature"))?,
                )
                .map_err(|_| Error::Authentication("RSA signature mismatch"))
        }
        AuthMethod::EcdsaSha256P256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                .map_err(|_| Error::Authentication("bad ECDSA key"))?;
            let signature = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| Error::Authentication("bad signature"))?;
            key.verify(octets, &signature)
                .map_err(|_| Error::Authentication("ECDSA signature mismatch"))
        }
        AuthMethod::EcdsaSha384P384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                .map_err(|_| Error::Authentication("bad ECDSA key"))?;
            let signature = p384::ecdsa::Signature::from_slice(signature)
                .map_err(|_| Error::Authentication("bad signature"))?;
            key.verify(octets, &signature)
                .map_err(|_| Error::Authentication("ECDSA signature mismatch"))
        }
        AuthMethod::DigitalSignature => verify_rfc7427(key_bytes, octets, signature),
        _ => Err(Error::Authentication("unsupported auth method")),
    }
}

/// RFC 7427: the signature value is prefixed with a length octet and the
/// DER AlgorithmIdentifier naming hash and key type
fn verify_rfc7427(key_bytes: &[u8], octets: &[u8], framed: &[u8]) -> Result<()> {
    let (&prefix_len, rest) = framed
        .split_first()
        .ok_or(Error::Authentication("empty signature"))?;
    let prefix_len = usize::from(prefix_len);
    if rest.len() <= prefix_len {
        return Err(Error::Authentication("bad signature framing"));
    }
    let (algorithm, signature) = rest.split_at(prefix_len);

    if algorithm == SIG_RSA_SHA256 {
        let key = rsa::RsaPublicKey::from_pkcs1_der(key_bytes)
            .map_err(|_| Error::Authentication("bad RSA key"))?;
        let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
        return verifier
            .verify(
                octets,
                &rsa::pkcs1v15::Signature::try_from(signature)
                    .map_err(|_| Error::Authentication("bad signature"))?,
            )
            .map_err(|_| Error::Authentication("RSA signature mismatch"));
    }
    if algorithm == SIG_ECDSA_SHA256 {
        let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
            .map_err(|_| Error::Authentication("bad ECDSA key"))?;
        let signature = p256::ecdsa::DerSignature::from_bytes(signature)
            .map_err(|_| Error::Authentication("bad signature"))?;
        key.verify(octets, &signature)
            .map_err(|_| Error::Authentication("ECDSA signature mismatch"))
    } else if algorithm == SIG_ECDSA_SHA384 {
        let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
            .map_err(|_| Error::Authentication("bad ECDSA key"))?;
        let signature = p384::ecdsa::DerSignature::from_bytes(signature)
            .map_err(|_| Error::Authentication("bad signature"))?;
        key.verify(octets, &signature)
            .map_err(|_| Error::Authentication("ECDSA signature mismatch"))
    } else if algorithm == SIG_ED25519 {
        let key_bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| Error::Authentication("bad Ed25519 key"))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| Error::Authentication("bad Ed25519 key"))?;
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| Error::Authentication("bad signature"))?;
        key.verify(octets, &signature)
            .map_err(|_| Error::Authentication("Ed25519 signature mismatch"))
    } else {
        Err(Error::Authentication("unknown signature algorithm"))
    }
}

/// Verify that `cert` was signed by `issuer`'s key
fn verify_x509_signature(cert: &X509Certificate, issuer: &X509Certificate) -> Result<()> {
    let tbs = cert.tbs_certificate.as_ref();
    let signature = cert.signature_value.data.as_ref();
    let spki = issuer.tbs_certificate.subject_pki.raw;
    let algorithm = &cert.signature_algorithm.algorithm;

    if *algorithm == oid_registry::OID_PKCS1_SHA256WITHRSA {
        let mut framed = vec![SIG_RSA_SHA256.len() as u8];
        framed.extend_from_slice(SIG_RSA_SHA256);
        framed.extend_from_slice(signature);
        let (_, spki) = SubjectPublicKeyInfo::from_der(spki)
            .map_err(|_| Error::Authentication("bad issuer key"))?;
        verify_rfc7427(&spki.subject_public_key.data, tbs, &framed)
    } else if *algorithm == oid_registry::OID_SIG_ECDSA_WITH_SHA256 {
        let (_, parsed) = SubjectPublicKeyInfo::from_der(spki)
            .map_err(|_| Error::Authentication("bad issuer key"))?;
        let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&parsed.subject_public_key.data)
            .map_err(|_| Error::Authentication("bad issuer key"))?;
        let signature = p256::ecdsa::DerSignature::from_bytes(signature)
            .map_err(|_| Error::Authentication("bad signature"))?;
        key.verify(tbs, &signature)
            .map_err(|_| Error::Authentication("issuer signature mismatch"))
    } else if *algorithm == oid_registry::OID_SIG_ED25519 {
        let (_, parsed) = SubjectPublicKeyInfo::from_der(spki)
            .map_err(|_| Error::Authentication("bad issuer key"))?;
        let key_bytes: [u8; 32] = parsed
            .subject_public_key
            .data
            .as_ref()
            .try_into()
            .map_err(|_| Error::Authentication("bad issuer key"))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| Error::Authentication("bad issuer key"))?;
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| Error::Authentication("bad signature"))?;
        key.verify(tbs, &signature)
            .map_err(|_| Error::Authentication("issuer signature mismatch"))
    } else {
        Err(Error::Authentication("unknown certificate signature algorithm"))
    }
}

/// Whether the certificate carries the claimed identity in its subject
/// alternative names (or, for DN identities, its subject)
fn cert_matches_id(cert: &X509Certificate, id: &IkeId) -> bool {
    if let IkeId::Asn1Dn(der) = id {
        return cert.subject().as_raw() == der.as_slice();
    }
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return false;
    };
    san.value.general_names.iter().any(|name| match (name, id) {
        (GeneralName::DNSName(dns), IkeId::Fqdn(fqdn)) => *dns == fqdn.as_str(),
        (GeneralName::RFC822Name(mail), IkeId::UserFqdn(user)) => *mail == user.as_str(),
        (GeneralName::IPAddress(octets), IkeId::Ipv4(addr)) => *octets == addr.octets(),
        (GeneralName::IPAddress(octets), IkeId::Ipv6(addr)) => *octets == addr.octets(),
        _ => false,
    })
}

/// Read every parseable DER (or PEM wrapped) file of a directory
fn read_der_dir(dir: &Path) -> Vec<Vec<u8>> {
    let mut out = vec![];
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let Ok(data) = std::fs::read(entry.path()) else {
            continue;
        };
        if data.starts_with(b"-----BEGIN") {
            if let Ok((_, pem)) = parse_x509_pem(&data) {
                out.push(pem.contents);
            }
        } else {
            out.push(data);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn rfc7427_ecdsa_roundtrip() {
        use p256::pkcs8::EncodePublicKey as _;

        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let spki_der = key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();

        let mut store = CertStore::empty();
        store.key = Some(LocalKey::EcdsaP256(key));
        let octets = b"init message | nonce | prf(SK_p, ID)";
        let (method, framed) = store.sign(octets, true).unwrap();
        assert_eq!(method, AuthMethod::DigitalSignature);

        assert!(verify_with_spki(&spki_der, method, octets, &framed).is_ok());
        assert!(verify_with_spki(&spki_der, method, b"other octets", &framed).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn legacy_ecdsa_without_sha2_support() {
        use p256::pkcs8::EncodePublicKey as _;

        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let spki_der = key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();

        let mut store = CertStore::empty();
        store.key = Some(LocalKey::EcdsaP256(key));
        let octets = b"legacy peer octets";
        let (method, signature) = store.sign(octets, false).unwrap();
        assert_eq!(method, AuthMethod::EcdsaSha256P256);
        assert!(verify_with_spki(&spki_der, method, octets, &signature).is_ok());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn ed25519_refuses_downgrade() {
        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let mut store = CertStore::empty();
        store.key = Some(LocalKey::Ed25519(Box::new(key)));
        // no SHA-2 support on the peer: refuse instead of downgrading
        assert!(store.sign(b"octets", false).is_err());
        assert!(store.sign(b"octets", true).is_ok());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn rfc7427_ed25519_roundtrip() {
        use ed25519_dalek::pkcs8::EncodePublicKey as _;

        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let spki_der = key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        let mut store = CertStore::empty();
        store.key = Some(LocalKey::Ed25519(Box::new(key)));
        let (method, framed) = store.sign(b"octets", true).unwrap();
        assert!(verify_with_spki(&spki_der, method, b"octets", &framed).is_ok());
    }

    #[test]
    fn no_key_material_is_an_error() {
        let store = CertStore::empty();
        assert!(store
            .verify_auth(
                None,
                &IkeId::Fqdn("peer.example.org".into()),
                AuthMethod::DigitalSignature,
                b"octets",
                b"sig",
            )
            .is_err());
    }
}
