//! Key material for the proprietary pairing exchange and LE link encryption.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

/// XORed with public key A to obtain the provisional long-term key.
pub const DEVICE_KEY_CONSTANT: [u8; 16] = [
    0x40, 0xB0, 0x8A, 0x5F, 0xCD, 0x1F, 0x9B, 0x41, 0x12, 0x5C, 0xAC, 0xC6, 0x3F, 0x38, 0xA0, 0x73,
];

// Offsets inside the SPI pairing block (after the 16 byte response header).
const SPI_EDIV: usize = 0x0E;
const SPI_RAND: usize = 0x10;
const SPI_LTK: usize = 0x1A;
const SPI_MIN_LEN: usize = 0x30;

pub fn derive_ltk(public_key_a: &[u8; 16]) -> [u8; 16] {
    let mut ltk = [0u8; 16];
    for (i, byte) in ltk.iter_mut().enumerate() {
        *byte = public_key_a[i] ^ DEVICE_KEY_CONSTANT[i];
    }
    ltk
}

fn reversed(bytes: &[u8; 16]) -> [u8; 16] {
    let mut out = *bytes;
    out.reverse();
    out
}

/// `AES-128-ECB(ltk, reverse(challenge))`
pub fn expected_challenge_response(ltk: &[u8; 16], challenge: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(ltk));
    let mut block = GenericArray::clone_from_slice(&reversed(challenge));
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// Locally generated half of the pairing exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub public_key_a: [u8; 16],
    pub derived_ltk: [u8; 16],
    pub challenge: [u8; 16],
}

impl KeyMaterial {
    pub fn generate<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut public_key_a = [0u8; 16];
        let mut challenge = [0u8; 16];
        rng.fill_bytes(&mut public_key_a);
        rng.fill_bytes(&mut challenge);
        Self {
            public_key_a,
            derived_ltk: derive_ltk(&public_key_a),
            challenge,
        }
    }

    pub fn verify_challenge(&self, proof: &[u8; 16]) -> bool {
        expected_challenge_response(&self.derived_ltk, &self.challenge) == *proof
    }
}

/// Parameters for one enable-encryption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkKey {
    pub ediv: u16,
    pub rand: [u8; 8],
    pub ltk: [u8; 16],
}

impl LinkKey {
    pub fn plain(ltk: [u8; 16]) -> Self {
        Self {
            ediv: 0,
            rand: [0; 8],
            ltk,
        }
    }
}

/// Key material stored in the controller's flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiKey {
    pub ediv: u16,
    pub rand: [u8; 8],
    pub ltk: [u8; 16],
}

impl SpiKey {
    /// Parses an SPI read response of the pairing data block. Short responses carry only a key
    /// in their trailing 16 bytes.
    pub fn from_response(response: &[u8]) -> Option<Self> {
        let header = super::protocol::SPI_RESPONSE_HEADER;
        if response.len() >= header + SPI_MIN_LEN {
            let spi = &response[header..];
            let mut rand = [0u8; 8];
            rand.copy_from_slice(&spi[SPI_RAND..SPI_RAND + 8]);
            let mut ltk = [0u8; 16];
            ltk.copy_from_slice(&spi[SPI_LTK..SPI_LTK + 16]);
            Some(Self {
                ediv: u16::from_le_bytes([spi[SPI_EDIV], spi[SPI_EDIV + 1]]),
                rand,
                ltk,
            })
        } else if response.len() >= 16 {
            let mut ltk = [0u8; 16];
            ltk.copy_from_slice(&response[response.len() - 16..]);
            Some(Self {
                ediv: 0,
                rand: [0; 8],
                ltk,
            })
        } else {
            None
        }
    }
}

/// Ordered, de-duplicated list of keys to try when encrypting the link.
pub fn encryption_candidates(derived: Option<&[u8; 16]>, spi: Option<&SpiKey>) -> Vec<LinkKey> {
    let mut ordered = Vec::with_capacity(5);
    if let Some(ltk) = derived {
        ordered.push(LinkKey::plain(*ltk));
        ordered.push(LinkKey::plain(reversed(ltk)));
    }
    if let Some(spi) = spi {
        if spi.ediv != 0 || spi.rand != [0; 8] {
            ordered.push(LinkKey {
                ediv: spi.ediv,
                rand: spi.rand,
                ltk: spi.ltk,
            });
        }
        ordered.push(LinkKey::plain(spi.ltk));
        ordered.push(LinkKey::plain(reversed(&spi.ltk)));
    }

    let mut candidates: Vec<LinkKey> = Vec::with_capacity(ordered.len());
    for key in ordered {
        if !candidates.contains(&key) {
            candidates.push(key);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn challenge_response_matches_fips_vector() {
        // FIPS-197 C.1, with the plaintext supplied in reverse.
        let key: [u8; 16] = core::array::from_fn(|i| i as u8);
        let plaintext: [u8; 16] = core::array::from_fn(|i| (i as u8) * 0x11);
        let challenge = reversed(&plaintext);
        assert_eq!(
            expected_challenge_response(&key, &challenge),
            [
                0x69, 0xC4, 0xE0, 0xD8, 0x6A, 0x7B, 0x04, 0x30, 0xD8, 0xCD, 0xB7, 0x80, 0x70, 0xB4,
                0xC5, 0x5A
            ]
        );
    }

    #[test]
    fn derived_key_xors_constant() {
        assert_eq!(derive_ltk(&[0; 16]), DEVICE_KEY_CONSTANT);
        assert_eq!(derive_ltk(&DEVICE_KEY_CONSTANT), [0; 16]);
    }

    #[test]
    fn generated_material_verifies_its_own_proof() {
        let mut rng = StdRng::seed_from_u64(7);
        let keys = KeyMaterial::generate(&mut rng);
        assert_eq!(keys.derived_ltk, derive_ltk(&keys.public_key_a));
        let proof = expected_challenge_response(&keys.derived_ltk, &keys.challenge);
        assert!(keys.verify_challenge(&proof));
        assert!(!keys.verify_challenge(&[0; 16]));
    }

    #[test]
    fn spi_block_yields_diversifier_and_key() {
        let mut response = vec![0u8; 16 + 0x40];
        let spi = &mut response[16..];
        spi[0x0E] = 0x34;
        spi[0x0F] = 0x12;
        spi[0x10..0x18].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        spi[0x1A..0x2A].copy_from_slice(&[0xAA; 16]);

        let key = SpiKey::from_response(&response).unwrap();
        assert_eq!(key.ediv, 0x1234);
        assert_eq!(key.rand, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(key.ltk, [0xAA; 16]);

        let short: Vec<u8> = (0..20).collect();
        let key = SpiKey::from_response(&short).unwrap();
        assert_eq!(key.ltk[0], 4);
        assert_eq!(key.ediv, 0);
        assert!(SpiKey::from_response(&[0; 8]).is_none());
    }

    #[test]
    fn candidates_try_derived_key_first_and_drop_duplicates() {
        let derived: [u8; 16] = core::array::from_fn(|i| i as u8);
        let spi = SpiKey {
            ediv: 0x0102,
            rand: [9; 8],
            ltk: derived,
        };
        let keys = encryption_candidates(Some(&derived), Some(&spi));
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], LinkKey::plain(derived));
        assert_eq!(keys[1], LinkKey::plain(reversed(&derived)));
        assert_eq!(keys[2].ediv, 0x0102);

        let bare = SpiKey {
            ediv: 0,
            rand: [0; 8],
            ltk: [0x55; 16],
        };
        assert_eq!(
            encryption_candidates(None, Some(&bare)),
            vec![LinkKey::plain([0x55; 16])]
        );
    }
}
