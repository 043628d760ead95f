use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};

use crate::error::{AgentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Domain separation tag of the BLS12-381 G2 signature ciphersuite used on
/// the wire.
const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Freshly generated agent key material, base64 encoded.
pub struct GeneratedKeys {
    pub bls_public: String,
    pub bls_private: String,
    pub ec_public: String,
    pub ec_private: String,
}

/// HMAC-SHA256 over `timestamp ‖ method ‖ url ‖ body` with the api-key
/// secret. This is the request signature the authority expects on token
/// issuance.
pub fn hmac_sum(timestamp: &str, method: &str, url: &str, secret: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AgentError::Signature(format!("HMAC init failed: {}", e)))?;

    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(url.as_bytes());
    mac.update(body);

    Ok(mac.finalize().into_bytes().to_vec())
}

/// BLS-sign `message` with the raw private key bytes. The signature is
/// deterministic for a given key and message.
pub fn bls_sign(message: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
    let sk = blst::min_pk::SecretKey::from_bytes(private_key)
        .map_err(|e| AgentError::Signature(format!("invalid bls key: {:?}", e)))?;

    let sig = sk.sign(message, BLS_DST, &[]);
    Ok(sig.compress().to_vec())
}

/// Generate the agent keypairs from a 48-byte CSPRNG seed: a BLS keypair
/// from the seed itself and a secp256k1 keypair from `SHA256(seed)`.
pub fn generate_keys() -> Result<GeneratedKeys> {
    let mut seed = [0u8; 48];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);

    generate_keys_from_seed(&seed)
}

fn generate_keys_from_seed(seed: &[u8; 48]) -> Result<GeneratedKeys> {
    let bls_secret = blst::min_pk::SecretKey::key_gen(seed, &[])
        .map_err(|e| AgentError::Signature(format!("failed to generate bls key: {:?}", e)))?;
    let bls_public = bls_secret.sk_to_pk();

    let hashed_seed = Sha256::digest(seed);
    let ec_secret = k256::SecretKey::from_slice(&hashed_seed)
        .map_err(|e| AgentError::Signature(format!("failed to derive ec key: {}", e)))?;
    let ec_public = ec_secret.public_key();

    Ok(GeneratedKeys {
        bls_public: BASE64.encode(bls_public.compress()),
        bls_private: BASE64.encode(bls_secret.to_bytes()),
        ec_public: BASE64.encode(ec_public.to_encoded_point(false).as_bytes()),
        ec_private: BASE64.encode(ec_secret.to_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sum_is_stable() {
        let a = hmac_sum("1700000000", "GET", "https://api/token", b"secret", b"").unwrap();
        let b = hmac_sum("1700000000", "GET", "https://api/token", b"secret", b"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        // any input change must change the sum
        let c = hmac_sum("1700000001", "GET", "https://api/token", b"secret", b"").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_generate_keys_from_seed_deterministic() {
        let seed = [7u8; 48];
        let first = generate_keys_from_seed(&seed).unwrap();
        let second = generate_keys_from_seed(&seed).unwrap();
        assert_eq!(first.bls_private, second.bls_private);
        assert_eq!(first.ec_public, second.ec_public);

        // uncompressed secp256k1 point: 0x04 || x || y
        let ec_pub = BASE64.decode(&first.ec_public).unwrap();
        assert_eq!(ec_pub.len(), 65);
        assert_eq!(ec_pub[0], 0x04);
    }

    #[test]
    fn test_bls_sign_round_trip() {
        let keys = generate_keys().unwrap();
        let private = BASE64.decode(&keys.bls_private).unwrap();

        let sig = bls_sign(b"payload", &private).unwrap();
        // compressed G2 signature
        assert_eq!(sig.len(), 96);

        // deterministic signature for the same key and message
        let again = bls_sign(b"payload", &private).unwrap();
        assert_eq!(sig, again);
    }

    #[test]
    fn test_bls_sign_rejects_garbage_key() {
        assert!(bls_sign(b"payload", &[1, 2, 3]).is_err());
    }
}
