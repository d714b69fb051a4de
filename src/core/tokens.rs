//! Agent registration tokens. Only the sha256 of a token is stored.

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::store::{Direction, Store, TOKENS_BUCKET};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_raw_token() -> String {
    let bytes: [u8; 16] = rand::random();
    format!("cbt_{}", hex::encode(bytes))
}

#[derive(Clone)]
pub struct TokenLedger {
    store: Store,
}

impl TokenLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Issues a new token. The raw value is returned once and never stored.
    pub async fn create(&self, name: &str) -> Result<(String, TokenRecord)> {
        let raw_token = generate_raw_token();
        let token_hash = hash_token(&raw_token);
        let record = TokenRecord {
            id: token_hash[..12].to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_vec(&record)?;
        self.store
            .write(|tx| {
                tx.create_bucket_if_missing(&[TOKENS_BUCKET])?;
                tx.put(&[TOKENS_BUCKET], token_hash.as_bytes(), &encoded)
            })
            .await?;
        Ok((raw_token, record))
    }

    pub async fn validate(&self, raw_token: &str) -> Result<bool> {
        let token_hash = hash_token(raw_token);
        self.store
            .read(|tx| Ok(tx.get(&[TOKENS_BUCKET], token_hash.as_bytes())?.is_some()))
            .await
    }

    pub async fn list(&self) -> Result<Vec<TokenRecord>> {
        let keyed = self.list_keys().await?;
        Ok(keyed.into_iter().map(|(_, record)| record).collect())
    }

    pub async fn has_any(&self) -> Result<bool> {
        self.store
            .read(|tx| {
                let mut found = false;
                if tx.bucket_exists(&[TOKENS_BUCKET])? {
                    tx.scan(&[TOKENS_BUCKET], Direction::Forward, |_, _| {
                        found = true;
                        Ok(ControlFlow::Break(()))
                    })?;
                }
                Ok(found)
            })
            .await
    }

    /// Revokes by record id. Returns whether a token was removed.
    pub async fn revoke(&self, id: &str) -> Result<bool> {
        let tokens = self.list_keys().await?;
        let Some((key, _)) = tokens.into_iter().find(|(_, rec)| rec.id == id) else {
            return Ok(false);
        };
        self.store
            .write(|tx| tx.delete(&[TOKENS_BUCKET], &key))
            .await
    }

    async fn list_keys(&self) -> Result<Vec<(Vec<u8>, TokenRecord)>> {
        self.store
            .read(|tx| {
                let mut out: Vec<(Vec<u8>, TokenRecord)> = Vec::new();
                if !tx.bucket_exists(&[TOKENS_BUCKET])? {
                    return Ok(out);
                }
                tx.scan(&[TOKENS_BUCKET], Direction::Forward, |key, raw| {
                    out.push((key.to_vec(), serde_json::from_slice(raw)?));
                    Ok(ControlFlow::Continue(()))
                })?;
                Ok(out)
            })
            .await
    }
}
