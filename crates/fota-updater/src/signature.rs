//! RSA signature verification over committed partition contents.
//!
//! The digest is computed from what actually landed in flash, read back one
//! sector at a time, never from the network stream. For compressed payloads
//! the two differ until the write has fully completed.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::asset::CryptoAsset;
use crate::error::UpdateError;
use crate::flash::{FlashPartitions, PartitionInfo};

/// Default signature block length (RSA-4096).
pub const DEFAULT_SIGNATURE_LEN: usize = 512;

/// Verifies PKCS#1 v1.5 SHA-256 signatures against a loaded RSA key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: RsaPublicKey,
    signature_len: usize,
}

impl SignatureVerifier {
    /// Load the public key.
    ///
    /// Accepts SubjectPublicKeyInfo or PKCS#1 keys, PEM or DER.
    ///
    /// # Errors
    ///
    /// - `PublicKeyUnavailable` if the asset is empty or unreadable
    /// - `InvalidPublicKey` if it is not an RSA key whose modulus matches
    ///   `signature_len`
    pub fn new(asset: &CryptoAsset, signature_len: usize) -> Result<Self, UpdateError> {
        if !asset.is_usable() {
            error!(asset = %asset.name(), "Public key empty, can't validate");
            return Err(UpdateError::PublicKeyUnavailable);
        }

        let key = parse_public_key(asset.get()).ok_or_else(|| {
            warn!(asset = %asset.name(), "Public key is not an RSA key");
            UpdateError::InvalidPublicKey(format!("{} is not an RSA public key", asset.name()))
        })?;

        if key.size() != signature_len {
            return Err(UpdateError::InvalidPublicKey(format!(
                "{}-byte modulus cannot check {}-byte signatures",
                key.size(),
                signature_len
            )));
        }

        Ok(Self { key, signature_len })
    }

    pub fn signature_len(&self) -> usize {
        self.signature_len
    }

    /// Hash the first `len` bytes of `partition` and check `signature`.
    pub fn verify(
        &self,
        flash: &dyn FlashPartitions,
        partition: &PartitionInfo,
        signature: &[u8],
        len: u64,
    ) -> Result<(), UpdateError> {
        if signature.len() != self.signature_len {
            warn!(
                expected = self.signature_len,
                actual = signature.len(),
                "Signature block has the wrong length"
            );
            return Err(UpdateError::SignatureMismatch);
        }
        if len > partition.size {
            return Err(UpdateError::PartitionOverflow {
                offset: 0,
                len: len as usize,
                size: partition.size,
            });
        }

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; flash.sector_size()];
        let mut offset = 0u64;
        while offset < len {
            let n = buf.len().min((len - offset) as usize);
            flash.read(partition, offset, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        let digest = hasher.finalize();

        debug!(
            label = %partition.label,
            len,
            digest = %hex::encode(digest),
            "Partition digest computed"
        );

        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|e| {
                error!(label = %partition.label, error = %e, "Signature verification failed");
                UpdateError::SignatureMismatch
            })
    }
}

fn parse_public_key(bytes: &[u8]) -> Option<RsaPublicKey> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        let text = text.trim();
        if text.starts_with("-----BEGIN") {
            return RsaPublicKey::from_public_key_pem(text)
                .or_else(|_| RsaPublicKey::from_pkcs1_pem(text))
                .ok();
        }
    }
    RsaPublicKey::from_public_key_der(bytes)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(bytes))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{MemoryFlash, PartitionWriter, UpdateTarget};
    use rand_core::OsRng;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    const TEST_SIG_LEN: usize = 128;

    fn keypair() -> (RsaPrivateKey, CryptoAsset) {
        let private = RsaPrivateKey::new(&mut OsRng, TEST_SIG_LEN * 8).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, CryptoAsset::from_memory("rsa_key.pub", pem.into_bytes()))
    }

    fn sign(private: &RsaPrivateKey, image: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(image);
        private.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap()
    }

    fn flash_with(image: &[u8]) -> (MemoryFlash, PartitionInfo) {
        let mut flash = MemoryFlash::new(64 * 1024, 16 * 1024);
        let mut writer =
            PartitionWriter::begin(&mut flash, UpdateTarget::Firmware, Some(image.len() as u64)).unwrap();
        writer.write(image).unwrap();
        let partition = writer.end().unwrap();
        (flash, partition)
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_valid_signature_across_sectors() {
        let (private, asset) = keypair();
        let image = image(10_000);
        let (flash, partition) = flash_with(&image);

        let verifier = SignatureVerifier::new(&asset, TEST_SIG_LEN).unwrap();
        verifier
            .verify(&flash, &partition, &sign(&private, &image), image.len() as u64)
            .unwrap();
    }

    #[test]
    fn test_tampered_image_rejected() {
        let (private, asset) = keypair();
        let image = image(5000);
        let signature = sign(&private, &image);

        let mut tampered = image.clone();
        tampered[4097] ^= 0x01;
        let (flash, partition) = flash_with(&tampered);

        let verifier = SignatureVerifier::new(&asset, TEST_SIG_LEN).unwrap();
        assert!(matches!(
            verifier.verify(&flash, &partition, &signature, image.len() as u64),
            Err(UpdateError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_wrong_signature_length() {
        let (_, asset) = keypair();
        let (flash, partition) = flash_with(&image(100));
        let verifier = SignatureVerifier::new(&asset, TEST_SIG_LEN).unwrap();
        assert!(matches!(
            verifier.verify(&flash, &partition, &[0u8; 64], 100),
            Err(UpdateError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_pkcs1_der_key_accepted() {
        let private = RsaPrivateKey::new(&mut OsRng, TEST_SIG_LEN * 8).unwrap();
        let der = private.to_public_key().to_pkcs1_der().unwrap();
        let asset = CryptoAsset::from_memory("key.der", der.as_bytes().to_vec());
        assert!(SignatureVerifier::new(&asset, TEST_SIG_LEN).is_ok());
    }

    #[test]
    fn test_unusable_key() {
        let asset = CryptoAsset::from_memory("rsa_key.pub", vec![0x30]);
        assert!(matches!(
            SignatureVerifier::new(&asset, TEST_SIG_LEN),
            Err(UpdateError::PublicKeyUnavailable)
        ));
    }

    #[test]
    fn test_non_rsa_key_rejected() {
        let ec_pem = "-----BEGIN PUBLIC KEY-----\n\
            MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEEVs/o5+uQbTjL3chynL4wXgUg2R9\n\
            q9UU8I5mEovUf86QZ7kOBIjJwqnzD1omageEHWwHdBO6B+dFabmdT9POxg==\n\
            -----END PUBLIC KEY-----\n";
        let asset = CryptoAsset::from_memory("ec.pub", ec_pem.as_bytes().to_vec());
        assert!(matches!(
            SignatureVerifier::new(&asset, TEST_SIG_LEN),
            Err(UpdateError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_modulus_must_match_signature_length() {
        let (_, asset) = keypair();
        assert!(matches!(
            SignatureVerifier::new(&asset, DEFAULT_SIGNATURE_LEN),
            Err(UpdateError::InvalidPublicKey(_))
        ));
    }
}
