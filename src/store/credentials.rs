//! API-credential records and the decryption seam.
//!
//! The engine only ever sees ciphertext rows; turning them into usable
//! key material is the hosting application's job via
//! [`CredentialDecryptor`]. Decrypted secrets live in a
//! [`SecretString`] so they stay out of debug output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use sqlx::{Row, SqlitePool};

use super::StoreError;

/// One row of the `api_keys` table. Key material is ciphertext.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub exchange_id: i64,
    pub api_key_ct: String,
    pub secret_key_ct: String,
    pub is_testnet: bool,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Decrypted key material, handed to adapters on construction.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: SecretString,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Decryption is owned by the hosting application.
#[async_trait]
pub trait CredentialDecryptor: Send + Sync {
    async fn decrypt(&self, record: &ApiKeyRecord) -> Result<ApiCredentials, String>;
}

/// Pass-through decryptor for tests and local development, where the
/// "ciphertexts" are stored in the clear.
pub struct PlaintextDecryptor;

#[async_trait]
impl CredentialDecryptor for PlaintextDecryptor {
    async fn decrypt(&self, record: &ApiKeyRecord) -> Result<ApiCredentials, String> {
        Ok(ApiCredentials {
            api_key: record.api_key_ct.clone(),
            secret: SecretString::from(record.secret_key_ct.clone()),
        })
    }
}

/// Read access to the `api_keys` table.
#[derive(Clone)]
pub struct ApiKeyStore {
    pool: SqlitePool,
}

impl ApiKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, id: i64) -> Result<ApiKeyRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, exchange_id, api_key_ct, secret_key_ct, is_testnet, name, created_at
             FROM api_keys WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        Ok(ApiKeyRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            exchange_id: row.try_get("exchange_id")?,
            api_key_ct: row.try_get("api_key_ct")?,
            secret_key_ct: row.try_get("secret_key_ct")?,
            is_testnet: row.try_get("is_testnet")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Test/dev helper: insert a plaintext record and return its id.
    pub async fn insert_plaintext(
        &self,
        user_id: i64,
        exchange_id: i64,
        api_key: &str,
        secret_key: &str,
        is_testnet: bool,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO api_keys (user_id, exchange_id, api_key_ct, secret_key_ct, is_testnet, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(exchange_id)
        .bind(api_key)
        .bind(secret_key)
        .bind(is_testnet)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}
