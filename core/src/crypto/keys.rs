use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Sender string used by coinbase and genesis transactions. Exempt from
/// signature verification.
pub const GENESIS_SENDER: &str = "GENESIS";

/// Ed25519 signature check over raw bytes. Malformed key or signature
/// material verifies as false rather than erroring; callers treat every
/// failure mode as an invalid signature.
pub fn verify(public_key_bytes: &[u8], msg: &[u8], signature_bytes: &[u8]) -> bool {
    let Ok(pk_array) = <[u8; 32]>::try_from(public_key_bytes) else {
        return false;
    };
    let Ok(public_key) = VerifyingKey::from_bytes(&pk_array) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(signature_bytes) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    public_key.verify(msg, &signature).is_ok()
}

/// Generate a fresh Ed25519 keypair: secret bytes plus hex public key.
/// Wallet-facing helper; consensus code never creates keys.
pub fn generate_keypair() -> ([u8; 32], String) {
    let secret: [u8; 32] = rand::random();
    let signing_key = SigningKey::from_bytes(&secret);
    (secret, hex::encode(signing_key.verifying_key().to_bytes()))
}

/// Sign a message with a 32-byte Ed25519 secret key. Wallet and test helper;
/// consensus code only ever verifies.
pub fn sign(secret_key_bytes: &[u8; 32], msg: &[u8]) -> (String, String) {
    let signing_key = SigningKey::from_bytes(secret_key_bytes);
    let signature = signing_key.sign(msg);
    (
        hex::encode(signing_key.verifying_key().to_bytes()),
        hex::encode(signature.to_bytes()),
    )
}

const ONYX_BASE32_ALPHABET: &[u8; 32] = b"023456789acdefghjklmnpqrstuvwxyz";

/// Compute a 4-character checksum from the address body using SHA-256.
/// Derived from `"onyx1" + body[0..35]`, encoded as 4 base32 characters.
fn compute_address_checksum(body_35: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"onyx1");
    hasher.update(body_35.as_bytes());
    let hash = hasher.finalize();
    let mut ck = String::with_capacity(4);
    for &byte in &hash[..2] {
        ck.push(ONYX_BASE32_ALPHABET[(byte % 32) as usize] as char);
        ck.push(ONYX_BASE32_ALPHABET[((byte / 32) % 32) as usize] as char);
    }
    ck
}

/// Derive an `onyx1...` address from public key bytes (44 chars total):
///   1. `sha256(pubkey)` then `ripemd160` gives 20 bytes
///   2. each byte encodes as 2 base32 chars, truncated to a 35-char body
///   3. 4-char checksum of `"onyx1" + body` appended
pub fn address_from_public_key_bytes(public_key_bytes: &[u8]) -> String {
    let sha = Sha256::digest(public_key_bytes);
    let key_hash = Ripemd160::digest(sha);

    let mut data = String::with_capacity(40);
    for &byte in key_hash.as_slice() {
        data.push(ONYX_BASE32_ALPHABET[(byte % 32) as usize] as char);
        data.push(ONYX_BASE32_ALPHABET[((byte / 32) % 32) as usize] as char);
    }
    data.truncate(35);

    let checksum = compute_address_checksum(&data);
    format!("onyx1{data}{checksum}")
}

pub fn address_from_public_key(pk_hex: &str) -> Option<String> {
    let pk_bytes = hex::decode(pk_hex).ok()?;
    Some(address_from_public_key_bytes(&pk_bytes))
}

/// Convert public key hex to address; "INVALID" on undecodable input so the
/// comparison against the claimed sender fails closed.
pub fn address_from_public_key_hex(pk_hex: &str) -> String {
    address_from_public_key(pk_hex).unwrap_or_else(|| "INVALID".to_string())
}

/// Validate an onyx1 address: format and embedded checksum.
pub fn is_valid_address(address: &str) -> bool {
    if !address.starts_with("onyx1") {
        return false;
    }
    if address.len() != 44 {
        return false;
    }
    if !address
        .as_bytes()
        .iter()
        .skip(5)
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z'))
    {
        return false;
    }

    let body = &address[5..40];
    let expected_ck = compute_address_checksum(body);
    let actual_ck = &address[40..44];
    expected_ck == actual_ck
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_44_chars_with_prefix() {
        let addr = address_from_public_key_bytes(&[1u8; 32]);
        assert_eq!(addr.len(), 44);
        assert!(addr.starts_with("onyx1"));
    }

    #[test]
    fn checksum_round_trip() {
        for seed in 0u8..=255 {
            let addr = address_from_public_key_bytes(&[seed; 32]);
            assert!(is_valid_address(&addr), "checksum failed for seed {seed}: {addr}");
        }
    }

    #[test]
    fn checksum_detects_single_char_mutation() {
        let addr = address_from_public_key_bytes(&[42u8; 32]);
        let mut bad = addr.into_bytes();
        bad[10] = if bad[10] == b'0' { b'a' } else { b'0' };
        let bad_addr = String::from_utf8(bad).unwrap();
        assert!(!is_valid_address(&bad_addr));
    }

    #[test]
    fn different_pubkeys_different_addresses() {
        let a = address_from_public_key_bytes(&[0u8; 32]);
        let b = address_from_public_key_bytes(&[1u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn generated_keypair_signs_and_verifies() {
        let (secret, pk_hex) = generate_keypair();
        let msg = b"fresh key";
        let (pk_again, sig_hex) = sign(&secret, msg);
        assert_eq!(pk_hex, pk_again);
        let pk = hex::decode(&pk_hex).unwrap();
        let sig = hex::decode(&sig_hex).unwrap();
        assert!(verify(&pk, msg, &sig));
    }

    #[test]
    fn sign_then_verify() {
        let secret = [7u8; 32];
        let msg = b"onyx canonical digest";
        let (pk_hex, sig_hex) = sign(&secret, msg);
        let pk = hex::decode(&pk_hex).unwrap();
        let sig = hex::decode(&sig_hex).unwrap();
        assert!(verify(&pk, msg, &sig));
        assert!(!verify(&pk, b"tampered", &sig));
    }

    #[test]
    fn malformed_key_or_signature_verifies_false() {
        let secret = [8u8; 32];
        let msg = b"probe";
        let (pk_hex, sig_hex) = sign(&secret, msg);
        let pk = hex::decode(&pk_hex).unwrap();
        let sig = hex::decode(&sig_hex).unwrap();

        assert!(!verify(&pk[..31], msg, &sig));
        assert!(!verify(&pk, msg, &sig[..63]));
        assert!(!verify(&[], msg, &sig));
    }

    #[test]
    fn derived_address_matches_signing_key() {
        let secret = [9u8; 32];
        let (pk_hex, _) = sign(&secret, b"x");
        let addr = address_from_public_key_hex(&pk_hex);
        assert!(is_valid_address(&addr));
    }

    #[test]
    fn invalid_addresses_rejected() {
        assert!(!is_valid_address("zion1aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(!is_valid_address("onyx1short"));
        assert!(!is_valid_address(""));
    }
}
