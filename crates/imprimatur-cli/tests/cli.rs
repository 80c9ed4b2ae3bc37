//! Integration tests for the imprimatur CLI.
//!
//! Each test writes policies, resources and a signature store into a
//! temporary directory, invokes the `imprimatur` binary via `assert_cmd`,
//! and checks outputs and exit codes.

#![allow(deprecated)] // cargo_bin deprecation: macro replacement not yet stable

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use imprimatur_verify::pem::{der_to_pem, encode_p256_spki};
use imprimatur_verify::store::{ImageEntry, SignatureStore, StoredSignature};
use predicates::prelude::*;

const SIGNED: &str = "ghcr.io/kyverno/test-verify-image:signed";

/// Convenience: get a `Command` for the `imprimatur` binary.
fn imprimatur() -> Command {
    Command::cargo_bin("imprimatur").expect("imprimatur binary not found")
}

/// Generate a key, sign `images`, and write the store and public key.
/// Returns (store_path, public_key_pem).
fn create_signed_store(dir: &Path, images: &[&str]) -> (PathBuf, String) {
    use aws_lc_rs::rand::SystemRandom;
    use aws_lc_rs::signature::{ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair, KeyPair};
    use base64::Engine;

    let rng = SystemRandom::new();
    let pkcs8 =
        EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).expect("keygen");
    let key_pair =
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref()).expect("parse");
    let pub_pem = der_to_pem(
        &encode_p256_spki(key_pair.public_key().as_ref()),
        "PUBLIC KEY",
    );

    let mut store = SignatureStore::default();
    for image in images {
        let repository = image.rsplit_once(':').map_or(*image, |(repo, _)| repo);
        let payload = serde_json::json!({
            "critical": {
                "identity": { "docker-reference": repository },
                "image": { "docker-manifest-digest": "" },
                "type": "cosign container image signature"
            }
        })
        .to_string();
        let sig = key_pair.sign(&rng, payload.as_bytes()).expect("sign");
        store.images.insert((*image).to_owned(), ImageEntry {
            signatures: vec![StoredSignature {
                payload: base64::engine::general_purpose::STANDARD.encode(&payload),
                signature: base64::engine::general_purpose::STANDARD.encode(sig.as_ref()),
                certificate: None,
            }],
            attestations: Vec::new(),
        });
    }

    let store_path = dir.join("signatures.json");
    std::fs::write(&store_path, serde_json::to_string_pretty(&store).expect("serialize"))
        .expect("write store");
    (store_path, pub_pem)
}

/// A policy requiring a key signature on `ghcr.io/kyverno/*` images.
fn write_policy(dir: &Path, public_key: &str) -> PathBuf {
    let policy = serde_json::json!({
        "apiVersion": "imprimatur.dev/v1alpha1",
        "kind": "ImageVerificationPolicy",
        "metadata": { "name": "check-signature" },
        "spec": {
            "rules": [{
                "name": "pods-signed",
                "match": { "any": [{ "kind": "Pod" }] },
                "imageExtractors": [{ "path": "/spec/containers/*/image" }],
                "verify": [{
                    "imageReferences": ["ghcr.io/kyverno/*"],
                    "cosign": [{ "key": { "publicKey": public_key } }]
                }]
            }]
        }
    });
    let path = dir.join("policy.json");
    std::fs::write(&path, serde_json::to_string_pretty(&policy).unwrap()).unwrap();
    path
}

fn write_pod(dir: &Path, image: &str) -> PathBuf {
    let path = dir.join("pod.yaml");
    std::fs::write(
        &path,
        format!(
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: web\nspec:\n  containers:\n    - name: app\n      image: {image}\n"
        ),
    )
    .unwrap();
    path
}

fn verify_args<'a>(policy: &'a Path, resource: &'a Path, store: &'a Path) -> Vec<&'a str> {
    vec![
        "verify",
        "--policy",
        policy.to_str().unwrap(),
        "--resource",
        resource.to_str().unwrap(),
        "--signatures",
        store.to_str().unwrap(),
    ]
}

// ─── verify tests ───────────────────────────────────────────

#[test]
fn verify_signed_image_passes() {
    let dir = tempfile::tempdir().unwrap();
    let (store, key) = create_signed_store(dir.path(), &[SIGNED]);
    let policy = write_policy(dir.path(), &key);
    let pod = write_pod(dir.path(), SIGNED);

    imprimatur()
        .args(verify_args(&policy, &pod, &store))
        .assert()
        .success()
        .stdout(predicate::str::contains("Results for policy: check-signature"))
        .stdout(predicate::str::contains(format!(
            "Verifying image: {SIGNED}, result: PASS"
        )))
        .stdout(predicate::str::contains("Verification PASSED"));
}

#[test]
fn verify_unsigned_image_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (store, key) = create_signed_store(dir.path(), &[SIGNED]);
    let policy = write_policy(dir.path(), &key);
    let pod = write_pod(dir.path(), "ghcr.io/kyverno/test-verify-image:unsigned");

    imprimatur()
        .args(verify_args(&policy, &pod, &store))
        .assert()
        .failure()
        .stdout(predicate::str::contains("result: FAIL"))
        .stdout(predicate::str::contains("Failures:"))
        .stdout(predicate::str::contains("no signatures found"))
        .stdout(predicate::str::contains("Verification FAILED"));
}

#[test]
fn verify_wrong_key_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = create_signed_store(dir.path(), &[SIGNED]);
    let other = tempfile::tempdir().unwrap();
    let (_, other_key) = create_signed_store(other.path(), &[SIGNED]);
    let policy = write_policy(dir.path(), &other_key);
    let pod = write_pod(dir.path(), SIGNED);

    imprimatur()
        .args(verify_args(&policy, &pod, &store))
        .assert()
        .failure()
        .stdout(predicate::str::contains("no matching signatures"));
}

#[test]
fn verify_other_registry_skips() {
    let dir = tempfile::tempdir().unwrap();
    let (store, key) = create_signed_store(dir.path(), &[SIGNED]);
    let policy = write_policy(dir.path(), &key);
    let pod = write_pod(dir.path(), "docker.io/library/nginx:1.25");

    imprimatur()
        .args(verify_args(&policy, &pod, &store))
        .assert()
        .success()
        .stdout(predicate::str::contains("result: SKIP"));
}

#[test]
fn verify_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let (store, key) = create_signed_store(dir.path(), &[SIGNED]);
    let policy = write_policy(dir.path(), &key);
    let pod = write_pod(dir.path(), SIGNED);

    let mut args = verify_args(&policy, &pod, &store);
    args.push("--json");
    let output = imprimatur()
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).expect("valid JSON output");
    assert_eq!(json["passed"], serde_json::Value::Bool(true));
    let rule = &json["resources"][0]["policies"][0]["rules"][0];
    assert_eq!(rule["outcome"], "PASS");
    assert_eq!(rule["results"][0]["image"], SIGNED);
}

#[test]
fn verify_missing_policy_file_errors() {
    let dir = tempfile::tempdir().unwrap();
    let pod = write_pod(dir.path(), SIGNED);

    imprimatur()
        .args([
            "verify",
            "--policy",
            dir.path().join("missing.yaml").to_str().unwrap(),
            "--resource",
            pod.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load policies"));
}

#[test]
fn verify_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let (store, key) = create_signed_store(dir.path(), &[SIGNED]);
    let policy = write_policy(dir.path(), &key);
    let pod = write_pod(dir.path(), SIGNED);
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "concurency = 2\n").unwrap();

    imprimatur()
        .args(["--config", config.to_str().unwrap()])
        .args(verify_args(&policy, &pod, &store))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn verify_invalid_rule_errors_alongside_valid_rule() {
    let dir = tempfile::tempdir().unwrap();
    let (store, key) = create_signed_store(dir.path(), &[SIGNED]);
    let pod = write_pod(dir.path(), SIGNED);
    let policy = serde_json::json!({
        "apiVersion": "imprimatur.dev/v1alpha1",
        "kind": "ImageVerificationPolicy",
        "metadata": { "name": "mixed" },
        "spec": {
            "rules": [
                {
                    "name": "pods-signed",
                    "imageExtractors": [{ "path": "/spec/containers/*/image" }],
                    "verify": [{
                        "imageReferences": ["ghcr.io/kyverno/*"],
                        "cosign": [{ "key": { "publicKey": key } }]
                    }]
                },
                {
                    "name": "two-authorities",
                    "imageExtractors": [{ "path": "/spec/containers/*/image" }],
                    "verify": [{
                        "imageReferences": ["ghcr.io/kyverno/*"],
                        "cosign": [{
                            "key": { "publicKey": key },
                            "keyless": { "issuer": "https://issuer", "subject": "s" }
                        }]
                    }]
                }
            ]
        }
    });
    let policy_path = dir.path().join("mixed.json");
    std::fs::write(&policy_path, serde_json::to_string_pretty(&policy).unwrap()).unwrap();

    imprimatur()
        .args(verify_args(&policy_path, &pod, &store))
        .assert()
        .code(1)
        .stdout(predicate::str::contains(format!(
            "Verifying image: {SIGNED}, result: PASS"
        )))
        .stdout(predicate::str::contains(
            "Rule result: ERROR (invalid rule `two-authorities`",
        ))
        .stdout(predicate::str::contains("Verification FAILED"));
}

// ─── validate tests ─────────────────────────────────────────

#[test]
fn validate_accepts_policy() {
    let dir = tempfile::tempdir().unwrap();
    let policy = write_policy(dir.path(), "key");

    imprimatur()
        .args(["validate", "--policy", policy.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] check-signature (1 rules)"));
}

#[test]
fn validate_rejects_multiple_authorities() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    std::fs::write(
        &path,
        r"apiVersion: imprimatur.dev/v1alpha1
kind: ImageVerificationPolicy
metadata:
  name: bad
spec:
  rules:
    - name: two-authorities
      imageExtractors:
        - path: /spec/containers/*/image
      verify:
        - imageReferences: '*'
          cosign:
            - key:
                publicKey: pem
              keyless:
                issuer: https://token.actions.githubusercontent.com
                subject: https://github.com/org/*
",
    )
    .unwrap();

    imprimatur()
        .args(["validate", "--policy", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("multiple attestor"));
}

#[test]
fn help_lists_subcommands() {
    imprimatur()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("validate"));
}
