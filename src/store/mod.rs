//! Durable state: the order repository and API-credential records.

pub mod credentials;
pub mod orders;

pub use credentials::{
    ApiCredentials, ApiKeyRecord, ApiKeyStore, CredentialDecryptor, PlaintextDecryptor,
};
pub use orders::{connect, OrderRepository, StoreError, TransitionPatch};
