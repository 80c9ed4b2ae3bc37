//! Signature primitives used by the offline signature store.
//!
//! Supports two verification paths:
//! - **Key**: ECDSA P-256 verification using `aws-lc-rs`.
//! - **Certificate**: the public key is taken from an X.509 certificate and
//!   checked with the `sigstore` crate, which auto-detects the algorithm.
//!   Keyless identities (SAN and Fulcio issuer) are read from the same
//!   certificate.

use aws_lc_rs::signature::{self, ECDSA_P256_SHA256_ASN1};
use base64::Engine;
use der::asn1::Utf8StringRef;
use der::oid::{AssociatedOid, ObjectIdentifier};
use der::{Decode, Encode};
use sigstore::crypto::{CosignVerificationKey, Signature};
use x509_cert::Certificate;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::pkix::name::GeneralName;

use crate::error::VerificationError;
use crate::pem::{P256_SPKI_HEADER, pem_to_der};

/// Fulcio OIDC issuer extension (raw string value).
const FULCIO_ISSUER_V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.1");

/// Fulcio OIDC issuer extension (DER `UTF8String` value).
const FULCIO_ISSUER_V2: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.8");

/// Verify a base64 signature over `payload` with a PEM P-256 public key.
pub fn verify_with_key(
    payload: &[u8],
    signature_b64: &str,
    public_key_pem: &str,
) -> Result<(), VerificationError> {
    if signature_b64.is_empty() {
        return Err(VerificationError::InvalidSignature(
            "empty signature".to_owned(),
        ));
    }

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|e| {
            VerificationError::InvalidSignature(format!("invalid base64 signature: {e}"))
        })?;

    let spki_der = pem_to_der(public_key_pem)
        .ok_or_else(|| VerificationError::InvalidSignature("invalid PEM public key".to_owned()))?;

    // Strip the SPKI header to get the raw EC point
    let raw_point = spki_der
        .strip_prefix(P256_SPKI_HEADER.as_slice())
        .filter(|point| !point.is_empty())
        .ok_or_else(|| {
            VerificationError::InvalidSignature("public key is not a P-256 SPKI key".to_owned())
        })?;

    signature::UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, raw_point)
        .verify(payload, &sig_bytes)
        .map_err(|e| VerificationError::InvalidSignature(format!("ECDSA verification failed: {e}")))
}

/// Parse the first certificate of a PEM chain.
pub fn parse_certificate(pem: &str) -> Result<Certificate, VerificationError> {
    let cert_der = pem_to_der(pem)
        .ok_or_else(|| VerificationError::InvalidSignature("invalid PEM certificate".to_owned()))?;

    Certificate::from_der(&cert_der).map_err(|e| {
        VerificationError::InvalidSignature(format!("failed to parse X.509 certificate: {e}"))
    })
}

/// Verify a base64 signature over `payload` with a certificate's key.
pub fn verify_with_certificate(
    payload: &[u8],
    signature_b64: &str,
    cert: &Certificate,
) -> Result<(), VerificationError> {
    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| VerificationError::InvalidSignature(format!("failed to encode SPKI: {e}")))?;

    let verification_key = CosignVerificationKey::try_from_der(&spki_der).map_err(|e| {
        VerificationError::InvalidSignature(format!("unsupported key type in certificate: {e}"))
    })?;

    verification_key
        .verify_signature(Signature::Base64Encoded(signature_b64.as_bytes()), payload)
        .map_err(|e| {
            VerificationError::InvalidSignature(format!(
                "sigstore signature verification failed: {e}"
            ))
        })
}

/// Identity claims of a keyless signing certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateIdentity {
    /// Email and URI subject alternative names.
    pub subjects: Vec<String>,
    /// OIDC issuer recorded by Fulcio.
    pub issuer: Option<String>,
}

/// Read the SAN and Fulcio issuer extensions.
pub fn certificate_identity(cert: &Certificate) -> Result<CertificateIdentity, VerificationError> {
    let mut identity = CertificateIdentity::default();
    let extensions = cert.tbs_certificate.extensions.as_deref().unwrap_or_default();

    for ext in extensions {
        let value = ext.extn_value.as_bytes();
        if ext.extn_id == SubjectAltName::OID {
            let san = SubjectAltName::from_der(value).map_err(|e| {
                let reason = format!("invalid subject alternative name: {e}");
                VerificationError::InvalidSignature(reason)
            })?;
            for name in san.0 {
                match name {
                    GeneralName::Rfc822Name(email) => identity.subjects.push(email.to_string()),
                    GeneralName::UniformResourceIdentifier(uri) => {
                        identity.subjects.push(uri.to_string());
                    }
                    _ => {}
                }
            }
        } else if ext.extn_id == FULCIO_ISSUER_V2 {
            let issuer = Utf8StringRef::from_der(value).map_err(|e| {
                VerificationError::InvalidSignature(format!("invalid issuer extension: {e}"))
            })?;
            identity.issuer = Some(issuer.as_str().to_owned());
        } else if ext.extn_id == FULCIO_ISSUER_V1 && identity.issuer.is_none() {
            identity.issuer = Some(String::from_utf8_lossy(value).into_owned());
        }
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pem::{der_to_pem, encode_p256_spki};
    use aws_lc_rs::rand::SystemRandom;
    use aws_lc_rs::signature::{ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair, KeyPair};

    fn generate_test_keypair() -> (EcdsaKeyPair, String) {
        let rng = SystemRandom::new();
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).expect("keygen");
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref())
            .expect("parse key");
        let pub_pem = der_to_pem(
            &encode_p256_spki(key_pair.public_key().as_ref()),
            "PUBLIC KEY",
        );
        (key_pair, pub_pem)
    }

    fn sign_payload(key_pair: &EcdsaKeyPair, payload: &[u8]) -> String {
        let rng = SystemRandom::new();
        let sig = key_pair.sign(&rng, payload).expect("sign");
        base64::engine::general_purpose::STANDARD.encode(sig.as_ref())
    }

    #[test]
    fn key_signature_verifies() {
        let (key_pair, pub_pem) = generate_test_keypair();
        let payload = br#"{"critical":{}}"#;
        let sig_b64 = sign_payload(&key_pair, payload);
        verify_with_key(payload, &sig_b64, &pub_pem).expect("should verify");
    }

    #[test]
    fn wrong_key_fails() {
        let (key_pair, _) = generate_test_keypair();
        let (_, other_pub_pem) = generate_test_keypair();
        let payload = b"hello world";
        let sig_b64 = sign_payload(&key_pair, payload);

        assert!(verify_with_key(payload, &sig_b64, &other_pub_pem).is_err());
    }

    #[test]
    fn tampered_signature_fails() {
        let (key_pair, pub_pem) = generate_test_keypair();
        let payload = b"hello world";
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(sign_payload(&key_pair, payload))
            .unwrap();
        bytes[0] ^= 0xFF;
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);

        assert!(verify_with_key(payload, &sig_b64, &pub_pem).is_err());
    }

    #[test]
    fn empty_signature_rejected_early() {
        let (_, pub_pem) = generate_test_keypair();
        let err = verify_with_key(b"payload", "", &pub_pem).unwrap_err();
        assert!(err.to_string().contains("empty signature"), "got: {err}");
    }

    #[test]
    fn non_p256_key_rejected() {
        let pem = der_to_pem(&[0x30, 0x03, 0x02, 0x01, 0x00], "PUBLIC KEY");
        let err = verify_with_key(b"payload", "c2ln", &pem).unwrap_err();
        assert!(err.to_string().contains("P-256"), "got: {err}");
    }

    #[test]
    fn invalid_certificate_fails() {
        assert!(parse_certificate("not-a-valid-cert").is_err());
        assert!(parse_certificate("").is_err());
        let pem = der_to_pem(b"garbage", "CERTIFICATE");
        assert!(parse_certificate(&pem).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any payload signed with a key can be verified with the same key.
            #[test]
            fn sign_verify_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..1024)) {
                let (key_pair, pub_pem) = generate_test_keypair();
                let sig_b64 = sign_payload(&key_pair, &payload);
                let result = verify_with_key(&payload, &sig_b64, &pub_pem);
                prop_assert!(result.is_ok(), "valid signature should verify: {:?}", result.err());
            }

            /// Tampered payloads always fail verification.
            #[test]
            fn tampered_payload_always_fails(
                payload in prop::collection::vec(any::<u8>(), 1..1024),
                flip_idx in any::<prop::sample::Index>(),
            ) {
                let (key_pair, pub_pem) = generate_test_keypair();
                let sig_b64 = sign_payload(&key_pair, &payload);

                let mut tampered = payload;
                let idx = flip_idx.index(tampered.len());
                tampered[idx] ^= 0xFF;

                prop_assert!(verify_with_key(&tampered, &sig_b64, &pub_pem).is_err());
            }
        }
    }
}
