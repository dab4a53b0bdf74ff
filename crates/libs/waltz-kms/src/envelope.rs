use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand_core::{OsRng, RngCore};

use crate::error::KmsError;
use crate::keys::{PublicKey, SymKey, KEY_LEN};

pub const ENVELOPE_TYPE0: u8 = 0x00;
pub const ENVELOPE_TYPE1: u8 = 0x01;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypted wire unit carrying a JSON-RPC payload.
///
/// Type0 is the steady state: ciphertext for a topic whose symmetric key both
/// sides hold. Type1 attaches the sender's one-time public key and appears
/// only on pairing topics for the initial session proposal, before the
/// session key exists on the receiving side.
///
/// Wire layout: `[0x00][nonce || ct || tag]` or
/// `[0x01][sender:32][nonce || ct || tag]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    Type0 { sealbox: Vec<u8> },
    Type1 { sender: PublicKey, sealbox: Vec<u8> },
}

/// Result of opening an envelope: the plaintext plus the attached sender key
/// for Type1.
#[derive(Clone, Debug)]
pub struct OpenedPayload {
    pub payload: Vec<u8>,
    pub sender: Option<PublicKey>,
}

fn seal_box(payload: &[u8], key: &SymKey) -> Result<Vec<u8>, KmsError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| KmsError::InvalidKey { reason: "aead key has wrong length".into() })?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| KmsError::EncryptionFailed)?;

    let mut sealbox = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealbox.extend_from_slice(&nonce);
    sealbox.extend_from_slice(&ciphertext);
    Ok(sealbox)
}

fn open_box(sealbox: &[u8], key: &SymKey) -> Result<Vec<u8>, KmsError> {
    if sealbox.len() < NONCE_LEN + TAG_LEN {
        return Err(KmsError::malformed("sealbox shorter than nonce + tag"));
    }
    let (nonce, ciphertext) = sealbox.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| KmsError::InvalidKey { reason: "aead key has wrong length".into() })?;
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| KmsError::DecryptionFailed)
}

impl Envelope {
    /// Seals `payload` under `key`. With `sender` present the result is a
    /// Type1 envelope carrying that public key in the clear.
    pub fn seal(
        payload: &[u8],
        key: &SymKey,
        sender: Option<PublicKey>,
    ) -> Result<Self, KmsError> {
        let sealbox = seal_box(payload, key)?;
        Ok(match sender {
            None => Envelope::Type0 { sealbox },
            Some(sender) => Envelope::Type1 { sender, sealbox },
        })
    }

    /// Opens the envelope with `key`. `DecryptionFailed` on MAC mismatch is
    /// final: the message is dropped, never retried.
    pub fn open(&self, key: &SymKey) -> Result<OpenedPayload, KmsError> {
        match self {
            Envelope::Type0 { sealbox } => {
                Ok(OpenedPayload { payload: open_box(sealbox, key)?, sender: None })
            }
            Envelope::Type1 { sender, sealbox } => {
                Ok(OpenedPayload { payload: open_box(sealbox, key)?, sender: Some(*sender) })
            }
        }
    }

    pub fn sender(&self) -> Option<&PublicKey> {
        match self {
            Envelope::Type0 { .. } => None,
            Envelope::Type1 { sender, .. } => Some(sender),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Envelope::Type0 { sealbox } => {
                let mut out = Vec::with_capacity(1 + sealbox.len());
                out.push(ENVELOPE_TYPE0);
                out.extend_from_slice(sealbox);
                out
            }
            Envelope::Type1 { sender, sealbox } => {
                let mut out = Vec::with_capacity(1 + KEY_LEN + sealbox.len());
                out.push(ENVELOPE_TYPE1);
                out.extend_from_slice(sender.as_bytes());
                out.extend_from_slice(sealbox);
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KmsError> {
        let (&tag, rest) =
            bytes.split_first().ok_or_else(|| KmsError::malformed("empty envelope"))?;
        match tag {
            ENVELOPE_TYPE0 => {
                if rest.len() < NONCE_LEN + TAG_LEN {
                    return Err(KmsError::malformed("type0 envelope too short"));
                }
                Ok(Envelope::Type0 { sealbox: rest.to_vec() })
            }
            ENVELOPE_TYPE1 => {
                if rest.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
                    return Err(KmsError::malformed("type1 envelope too short"));
                }
                let (sender, sealbox) = rest.split_at(KEY_LEN);
                Ok(Envelope::Type1 {
                    sender: PublicKey::from_slice(sender)?,
                    sealbox: sealbox.to_vec(),
                })
            }
            other => Err(KmsError::malformed(format!("unknown envelope type {other:#04x}"))),
        }
    }

    /// Relay transport encoding (standard alphabet, padded).
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(value: &str) -> Result<Self, KmsError> {
        let bytes = STANDARD
            .decode(value)
            .map_err(|err| KmsError::malformed(format!("base64: {err}")))?;
        Self::from_bytes(&bytes)
    }

    /// URI transport encoding (url-safe alphabet, unpadded).
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    pub fn from_base64url(value: &str) -> Result<Self, KmsError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|err| KmsError::malformed(format!("base64url: {err}")))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SymKey {
        SymKey::from_bytes([byte; KEY_LEN])
    }

    #[test]
    fn type0_roundtrip() {
        let k = key(1);
        let envelope = Envelope::seal(b"hello relay", &k, None).expect("seal");
        assert!(matches!(envelope, Envelope::Type0 { .. }));

        let opened = envelope.open(&k).expect("open");
        assert_eq!(opened.payload, b"hello relay");
        assert!(opened.sender.is_none());
    }

    #[test]
    fn type1_carries_sender_key() {
        let k = key(2);
        let sender = PublicKey::from_bytes([9u8; KEY_LEN]);
        let envelope = Envelope::seal(b"proposal", &k, Some(sender)).expect("seal");

        let wire = envelope.to_bytes();
        assert_eq!(wire[0], ENVELOPE_TYPE1);
        assert_eq!(&wire[1..1 + KEY_LEN], sender.as_bytes());

        let opened = Envelope::from_bytes(&wire).expect("decode").open(&k).expect("open");
        assert_eq!(opened.payload, b"proposal");
        assert_eq!(opened.sender, Some(sender));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let envelope = Envelope::seal(b"secret", &key(3), None).expect("seal");
        let result = envelope.open(&key(4));
        assert_eq!(result.expect_err("must not decrypt"), KmsError::DecryptionFailed);
    }

    #[test]
    fn nonces_are_fresh() {
        let k = key(5);
        let a = Envelope::seal(b"same payload", &k, None).expect("seal");
        let b = Envelope::seal(b"same payload", &k, None).expect("seal");
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        assert!(matches!(
            Envelope::from_bytes(&[]),
            Err(KmsError::MalformedEnvelope { .. })
        ));
        assert!(matches!(
            Envelope::from_bytes(&[0x02, 1, 2, 3]),
            Err(KmsError::MalformedEnvelope { .. })
        ));
        assert!(matches!(
            Envelope::from_bytes(&[ENVELOPE_TYPE0, 1, 2, 3]),
            Err(KmsError::MalformedEnvelope { .. })
        ));
        assert!(matches!(
            Envelope::from_bytes(&vec![ENVELOPE_TYPE1; 20]),
            Err(KmsError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn tampered_sealbox_fails_mac() {
        let k = key(6);
        let mut wire = Envelope::seal(b"payload", &k, None).expect("seal").to_bytes();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        let result = Envelope::from_bytes(&wire).expect("decode").open(&k);
        assert_eq!(result.expect_err("mac must fail"), KmsError::DecryptionFailed);
    }

    #[test]
    fn base64_transport_roundtrips() {
        let k = key(7);
        let envelope = Envelope::seal(b"wire", &k, None).expect("seal");

        let relay = Envelope::from_base64(&envelope.to_base64()).expect("relay decode");
        assert_eq!(relay, envelope);

        let uri = Envelope::from_base64url(&envelope.to_base64url()).expect("uri decode");
        assert_eq!(uri, envelope);

        assert!(Envelope::from_base64("!!not base64!!").is_err());
    }
}
