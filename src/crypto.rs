//! Primitives shared by the string-encryption and password passes. Everything here matches
//! what the generated runtime classes do with the JDK (`AES/ECB/PKCS5Padding`,
//! `PBKDF2WithHmacSHA256`, `java.util.Base64`).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyInit};
use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use sha2::Sha256;

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

pub const KEY_LEN: usize = 16;
pub const SALT_LEN: usize = 16;
pub const HASH_LEN: usize = 32;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

pub type AesKey = [u8; KEY_LEN];

pub fn generate_key(rng: &mut impl RngCore) -> AesKey {
    let mut key = [0u8; KEY_LEN];
    rng.fill_bytes(&mut key);
    key
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .with_context(|| format!("Invalid base64: {text}"))
}

/// `base64(AES-128/ECB/PKCS7(utf8(plaintext)))`.
pub fn encrypt_string(key: &AesKey, plaintext: &str) -> String {
    let cipher = Aes128EcbEnc::new(key.into());
    encode_base64(&cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes()))
}

pub fn decrypt_string(key: &AesKey, encoded: &str) -> Result<String> {
    let data = decode_base64(encoded)?;
    let cipher = Aes128EcbDec::new(key.into());
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|_| anyhow!("Bad padding in encrypted string"))?;
    String::from_utf8(plain).context("Decrypted string is not UTF-8")
}

/// Salt and PBKDF2 hash, both base64, as embedded into the password check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaltedHash {
    pub salt: String,
    pub hash: String,
}

pub fn salted_hash(password: &str, rng: &mut impl RngCore) -> SaltedHash {
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let hash = derive(password, &salt, PBKDF2_ITERATIONS);
    SaltedHash {
        salt: encode_base64(&salt),
        hash: encode_base64(&hash),
    }
}

pub fn verify_password(password: &str, stored: &SaltedHash) -> Result<bool> {
    let salt = decode_base64(&stored.salt)?;
    let expected: [u8; HASH_LEN] = decode_base64(&stored.hash)?
        .try_into()
        .map_err(|_| anyhow!("Stored hash must be {HASH_LEN} bytes"))?;
    Ok(derive(password, &salt, PBKDF2_ITERATIONS) == expected)
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// 16 lowercase hex characters.
pub fn generate_password(rng: &mut impl RngCore) -> String {
    let mut bytes = [0u8; 8];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn aes_matches_the_fips_197_vector() {
        let key: AesKey = core::array::from_fn(|i| i as u8);
        let cipher = Aes128EcbEnc::new((&key).into());
        let plain = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let out = cipher.encrypt_padded_vec_mut::<Pkcs7>(&plain);
        assert_eq!(out.len(), 32);
        assert_eq!(hex::encode(&out[..16]), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn strings_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let key = generate_key(&mut rng);
        for s in ["", "hello", "Привет, мир", "tab\tand\nnewline"] {
            let enc = encrypt_string(&key, s);
            assert_ne!(enc, s);
            assert_eq!(decrypt_string(&key, &enc).unwrap(), s);
        }
    }

    #[test]
    fn wrong_key_does_not_decrypt_to_the_plaintext() {
        let mut rng = StdRng::seed_from_u64(1);
        let key = generate_key(&mut rng);
        let other = generate_key(&mut rng);
        let enc = encrypt_string(&key, "secret value");
        let dec = decrypt_string(&other, &enc);
        assert!(dec.map(|s| s != "secret value").unwrap_or(true));
    }

    #[test]
    fn pbkdf2_sha256_matches_published_vector() {
        let out = derive("password", b"salt", 1);
        assert_eq!(
            hex::encode(out),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn salted_hash_verifies_only_the_right_password() {
        let mut rng = StdRng::seed_from_u64(3);
        let stored = salted_hash("hunter2", &mut rng);
        assert_eq!(decode_base64(&stored.salt).unwrap().len(), SALT_LEN);
        assert!(verify_password("hunter2", &stored).unwrap());
        assert!(!verify_password("hunter3", &stored).unwrap());
    }

    #[test]
    fn generated_password_is_16_hex_chars() {
        let mut rng = StdRng::seed_from_u64(9);
        let pw = generate_password(&mut rng);
        assert_eq!(pw.len(), 16);
        assert!(pw.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
