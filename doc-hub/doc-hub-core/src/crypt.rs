//! Transparent field encryption. Fields listed in a document's `_encrypt`
//! array are stored as base64 ciphertext of their JSON encoding.

use crate::document::{fields, Document};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use serde_json::Value;

#[async_trait]
pub trait FieldCipher: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String>;
    async fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Stores values as-is.
pub struct PlainCipher;

#[async_trait]
impl FieldCipher for PlainCipher {
    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// AES-256-GCM with a key derived from the master key. The random nonce
/// is prepended to the ciphertext.
pub struct AesFieldCipher {
    key: LessSafeKey,
}

impl AesFieldCipher {
    pub fn new(master_key: &[u8]) -> Result<Self> {
        if master_key.len() != 32 {
            return Err(anyhow!("Master key must be 32 bytes"));
        }
        let mut hasher = ring::digest::Context::new(&ring::digest::SHA256);
        hasher.update(master_key);
        hasher.update(b"doc-hub/fields");
        let key_material = hasher.finish();
        let unbound = UnboundKey::new(&AES_256_GCM, key_material.as_ref())
            .map_err(|_| anyhow!("invalid key material"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }
}

#[async_trait]
impl FieldCipher for AesFieldCipher {
    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut sealed = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let data = BASE64.decode(ciphertext)?;
        if data.len() < 12 + AES_256_GCM.tag_len() {
            return Err(anyhow!("Invalid ciphertext"));
        }
        let (nonce_bytes, sealed) = data.split_at(12);
        let nonce = Nonce::assume_unique_for_key(
            nonce_bytes.try_into().map_err(|_| anyhow!("Invalid nonce"))?,
        );
        let mut buf = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| anyhow!("decryption failed"))?;
        Ok(String::from_utf8(plain.to_vec())?)
    }
}

pub async fn encrypt_value(cipher: &dyn FieldCipher, value: &Value) -> Result<Value> {
    let json = serde_json::to_string(value)?;
    Ok(Value::String(cipher.encrypt(&json).await?))
}

/// Encrypt every field named in `_encrypt`. Missing and null fields are skipped.
pub async fn encrypt_document(cipher: &dyn FieldCipher, mut doc: Document) -> Result<Document> {
    for field in doc.encrypted_fields() {
        if field == fields::ID || field == fields::ENCRYPT {
            continue;
        }
        let Some(value) = doc.get(&field).filter(|v| !v.is_null()).cloned() else {
            continue;
        };
        let sealed = encrypt_value(cipher, &value).await?;
        doc.insert(field, sealed);
    }
    Ok(doc)
}

/// Reverse of [`encrypt_document`]. Values that do not decrypt are left
/// untouched so documents written before encryption was enabled stay readable.
pub async fn decrypt_document(cipher: &dyn FieldCipher, mut doc: Document) -> Document {
    for field in doc.encrypted_fields() {
        let Some(Value::String(sealed)) = doc.get(&field).cloned() else {
            continue;
        };
        let opened = match cipher.decrypt(&sealed).await {
            Ok(json) => serde_json::from_str::<Value>(&json).ok(),
            Err(_) => None,
        };
        match opened {
            Some(value) => {
                doc.insert(field, value);
            }
            None => tracing::debug!(field = %field, "field is not encrypted, leaving as-is"),
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn aes_round_trip_uses_fresh_nonces() {
        let cipher = AesFieldCipher::new(&[7u8; 32]).unwrap();
        let a = cipher.encrypt("secret").await.unwrap();
        let b = cipher.encrypt("secret").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).await.unwrap(), "secret");
        assert!(cipher.decrypt("bm90IGNpcGhlcnRleHQ=").await.is_err());
        assert!(AesFieldCipher::new(b"short").is_err());
    }

    #[tokio::test]
    async fn documents_encrypt_listed_fields_only() {
        let cipher = AesFieldCipher::new(&[1u8; 32]).unwrap();
        let doc = Document::from_value(json!({
            "_id": "1",
            "_encrypt": ["card", "pin", "absent"],
            "card": {"number": "4111"},
            "pin": 1234,
            "name": "visible"
        }))
        .unwrap();
        let sealed = encrypt_document(&cipher, doc.clone()).await.unwrap();
        assert!(sealed.get("card").unwrap().is_string());
        assert_ne!(sealed.get("pin"), doc.get("pin"));
        assert_eq!(sealed.get("name"), doc.get("name"));
        assert!(sealed.get("absent").is_none());

        let opened = decrypt_document(&cipher, sealed).await;
        assert_eq!(opened, doc);
    }

    #[tokio::test]
    async fn plaintext_values_survive_decryption() {
        let doc = Document::from_value(json!({"_encrypt": ["note"], "note": "plain"})).unwrap();
        let cipher = AesFieldCipher::new(&[2u8; 32]).unwrap();
        let opened = decrypt_document(&cipher, doc.clone()).await;
        assert_eq!(opened, doc);
    }
}
