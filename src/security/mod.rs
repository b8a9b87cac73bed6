// HSM-backed signing core
pub mod hsm;
pub mod pkcs11;

pub use hsm::{HsmConfig, HsmProvider, HsmSignatureResult, HsmStats, Signature};
