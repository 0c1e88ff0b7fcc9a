// Authentication module
// Manages credential lifecycle, refresh and interactive session extension

mod account;
pub(crate) mod claims;
mod extension;
mod refresh;
mod store;
mod types;

pub use account::AccountService;
pub use claims::decode_expiry;
pub use extension::{ExtensionPrompt, ExtensionState, SessionExtensionCoordinator, TerminalPrompt};
pub use refresh::{AdminLogin, RefreshCoordinator};
pub use store::TokenStore;
pub use types::{Credential, CredentialScope, Profile, TokenPair, ValidateResponse};
