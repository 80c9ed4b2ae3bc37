//! PEM and SPKI helpers for P-256 keys.

use base64::Engine;

/// Fixed SPKI header for an uncompressed P-256 public key.
#[rustfmt::skip]
pub(crate) const P256_SPKI_HEADER: [u8; 26] = [
    0x30, 0x59,                                     // SEQUENCE (89 bytes total)
    0x30, 0x13,                                     // SEQUENCE (19 bytes)
    0x06, 0x07,                                     // OID (7 bytes)
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01,       // 1.2.840.10045.2.1
    0x06, 0x08,                                     // OID (8 bytes)
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, // 1.2.840.10045.3.1.7
    0x03, 0x42, 0x00,                               // BIT STRING (66 bytes, 0 unused bits)
];

/// Encode DER bytes as PEM with the given label.
pub fn der_to_pem(der: &[u8], label: &str) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {label}-----\n");
    let mut rest = b64.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(64));
        pem.push_str(line);
        pem.push('\n');
        rest = tail;
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}

/// DER bytes of every PEM block in `pem`, in order.
pub fn pem_blocks(pem: &str) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut body: Option<String> = None;

    for line in pem.lines().map(str::trim) {
        if line.starts_with("-----BEGIN ") {
            body = Some(String::new());
        } else if line.starts_with("-----END ") {
            let decoded = body
                .take()
                .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok());
            blocks.extend(decoded);
        } else if let Some(b64) = body.as_mut() {
            b64.push_str(line);
        }
    }
    blocks
}

/// DER bytes of the first PEM block.
pub fn pem_to_der(pem: &str) -> Option<Vec<u8>> {
    pem_blocks(pem).into_iter().next()
}

/// Encode a raw uncompressed P-256 point as SPKI DER.
pub fn encode_p256_spki(point: &[u8]) -> Vec<u8> {
    let mut spki = Vec::with_capacity(P256_SPKI_HEADER.len() + point.len());
    spki.extend_from_slice(&P256_SPKI_HEADER);
    spki.extend_from_slice(point);
    spki
}
