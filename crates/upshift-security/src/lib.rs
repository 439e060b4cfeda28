pub mod credentials;

pub use credentials::{CredentialStore, KeyringCredentialStore, MemoryCredentialStore};
