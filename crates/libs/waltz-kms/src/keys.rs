use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KmsError;

pub const KEY_LEN: usize = 32;

/// Relay addressing unit, derived as `SHA-256(symmetric key)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic([u8; KEY_LEN]);

/// X25519 public key, 32 bytes. Hex on every wire surface.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

/// Derived or pre-shared symmetric key. Zeroized on drop, never serialized.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey([u8; KEY_LEN]);

impl Topic {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KmsError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KmsError::InvalidKey {
            reason: format!("topic must be {KEY_LEN} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KmsError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KmsError::InvalidKey {
            reason: format!("public key must be {KEY_LEN} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl SymKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KmsError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KmsError::InvalidKey {
            reason: format!("symmetric key must be {KEY_LEN} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

fn parse_hex32(value: &str, what: &str) -> Result<[u8; KEY_LEN], KmsError> {
    let bytes = hex::decode(value)
        .map_err(|err| KmsError::InvalidKey { reason: format!("{what}: {err}") })?;
    bytes.as_slice().try_into().map_err(|_| KmsError::InvalidKey {
        reason: format!("{what} must be {KEY_LEN} bytes, got {}", bytes.len()),
    })
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.to_hex())
    }
}

impl FromStr for Topic {
    type Err = KmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_hex32(value, "topic").map(Self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = KmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_hex32(value, "public key").map(Self)
    }
}

impl FromStr for SymKey {
    type Err = KmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_hex32(value, "symmetric key").map(Self)
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymKey(..)")
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

/// Raw key material storage, isolated from general record storage.
///
/// Implementations back onto a platform keychain or enclave; the in-memory
/// variant exists for tests and ephemeral clients.
pub trait SecretStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, KmsError>;
    fn put(&self, id: &str, material: Vec<u8>) -> Result<(), KmsError>;
    fn delete(&self, id: &str) -> Result<(), KmsError>;
}

#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, KmsError> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| KmsError::Store { reason: "secret store lock poisoned".into() })?;
        Ok(secrets.get(id).cloned())
    }

    fn put(&self, id: &str, material: Vec<u8>) -> Result<(), KmsError> {
        let mut secrets = self
            .secrets
            .write()
            .map_err(|_| KmsError::Store { reason: "secret store lock poisoned".into() })?;
        secrets.insert(id.to_owned(), material);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), KmsError> {
        let mut secrets = self
            .secrets
            .write()
            .map_err(|_| KmsError::Store { reason: "secret store lock poisoned".into() })?;
        secrets.remove(id);
        Ok(())
    }
}

fn key_pair_id(public: &PublicKey) -> String {
    format!("pk-{}", public.to_hex())
}

fn sym_key_id(topic: &Topic) -> String {
    format!("sym-{}", topic.to_hex())
}

/// Key management service: generation, agreement, derivation, storage facade.
#[derive(Clone)]
pub struct Kms {
    store: Arc<dyn SecretStore>,
}

impl Kms {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Generates an X25519 key pair, retaining the secret in the store keyed
    /// by the returned public key.
    pub fn generate_key_pair(&self) -> Result<PublicKey, KmsError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from_bytes(x25519_dalek::PublicKey::from(&secret).to_bytes());
        self.store.put(&key_pair_id(&public), secret.to_bytes().to_vec())?;
        Ok(public)
    }

    /// X25519 Diffie-Hellman with the stored secret for `self_public`,
    /// expanded through HKDF-SHA256. The info input binds both public keys
    /// (in canonical order, so either side derives the same key).
    pub fn key_agreement(
        &self,
        self_public: &PublicKey,
        peer_public: &PublicKey,
    ) -> Result<SymKey, KmsError> {
        let id = key_pair_id(self_public);
        let material =
            self.store.get(&id)?.ok_or_else(|| KmsError::key_not_found(id.as_str()))?;
        let secret_bytes: [u8; KEY_LEN] = material.as_slice().try_into().map_err(|_| {
            KmsError::InvalidKey { reason: "stored secret has wrong length".into() }
        })?;
        let secret = StaticSecret::from(secret_bytes);
        let shared =
            secret.diffie_hellman(&x25519_dalek::PublicKey::from(*peer_public.as_bytes()));

        let (lo, hi) = if self_public.as_bytes() <= peer_public.as_bytes() {
            (self_public, peer_public)
        } else {
            (peer_public, self_public)
        };
        let mut info = Vec::with_capacity(KEY_LEN * 2);
        info.extend_from_slice(lo.as_bytes());
        info.extend_from_slice(hi.as_bytes());

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; KEY_LEN];
        hk.expand(&info, &mut okm)
            .map_err(|_| KmsError::InvalidKey { reason: "hkdf expand failed".into() })?;
        Ok(SymKey::from_bytes(okm))
    }

    /// `topic = SHA-256(symmetric key)`.
    pub fn derive_topic(key: &SymKey) -> Topic {
        let digest = Sha256::digest(key.as_bytes());
        Topic::from_bytes(digest.into())
    }

    /// Generates a fresh pairing key directly (pre-shared via URI, no
    /// handshake), stores it, and returns its topic.
    pub fn generate_sym_key(&self) -> Result<(Topic, SymKey), KmsError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = SymKey::from_bytes(bytes);
        let topic = Self::derive_topic(&key);
        self.set_sym_key(&topic, &key)?;
        Ok((topic, key))
    }

    pub fn set_sym_key(&self, topic: &Topic, key: &SymKey) -> Result<(), KmsError> {
        self.store.put(&sym_key_id(topic), key.as_bytes().to_vec())
    }

    pub fn sym_key(&self, topic: &Topic) -> Result<SymKey, KmsError> {
        let id = sym_key_id(topic);
        let material =
            self.store.get(&id)?.ok_or_else(|| KmsError::key_not_found(id.as_str()))?;
        SymKey::from_slice(&material)
    }

    pub fn has_sym_key(&self, topic: &Topic) -> bool {
        matches!(self.store.get(&sym_key_id(topic)), Ok(Some(_)))
    }

    pub fn delete_sym_key(&self, topic: &Topic) -> Result<(), KmsError> {
        self.store.delete(&sym_key_id(topic))
    }

    pub fn delete_key_pair(&self, public: &PublicKey) -> Result<(), KmsError> {
        self.store.delete(&key_pair_id(public))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kms() -> Kms {
        Kms::new(Arc::new(InMemorySecretStore::new()))
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = kms();
        let b = kms();
        let a_pub = a.generate_key_pair().expect("generate a");
        let b_pub = b.generate_key_pair().expect("generate b");

        let ab = a.key_agreement(&a_pub, &b_pub).expect("a agrees");
        let ba = b.key_agreement(&b_pub, &a_pub).expect("b agrees");
        assert_eq!(ab, ba);
    }

    #[test]
    fn distinct_peers_derive_distinct_keys() {
        let a = kms();
        let a_pub = a.generate_key_pair().expect("generate a");
        let b_pub = kms().generate_key_pair().expect("generate b");
        let c_pub = kms().generate_key_pair().expect("generate c");

        let ab = a.key_agreement(&a_pub, &b_pub).expect("agree ab");
        let ac = a.key_agreement(&a_pub, &c_pub).expect("agree ac");
        assert_ne!(ab, ac);
    }

    #[test]
    fn agreement_without_stored_secret_fails() {
        let a = kms();
        let stranger = kms().generate_key_pair().expect("generate");
        let peer = kms().generate_key_pair().expect("generate");
        let result = a.key_agreement(&stranger, &peer);
        assert!(matches!(result, Err(KmsError::KeyNotFound { .. })));
    }

    #[test]
    fn topic_is_hash_of_key() {
        let key = SymKey::from_bytes([7u8; KEY_LEN]);
        let topic = Kms::derive_topic(&key);
        assert_eq!(topic, Kms::derive_topic(&key));
        assert_ne!(topic.as_bytes(), key.as_bytes());
    }

    #[test]
    fn sym_key_roundtrip_and_delete() {
        let kms = kms();
        let (topic, key) = kms.generate_sym_key().expect("generate");
        assert_eq!(kms.sym_key(&topic).expect("lookup"), key);
        assert!(kms.has_sym_key(&topic));

        kms.delete_sym_key(&topic).expect("delete");
        assert!(matches!(kms.sym_key(&topic), Err(KmsError::KeyNotFound { .. })));
        assert!(!kms.has_sym_key(&topic));
    }

    #[test]
    fn topic_hex_roundtrip() {
        let (topic, _) = kms().generate_sym_key().expect("generate");
        let parsed: Topic = topic.to_hex().parse().expect("parse hex");
        assert_eq!(parsed, topic);

        assert!("zz".parse::<Topic>().is_err());
        assert!("abcd".parse::<Topic>().is_err());
    }
}
