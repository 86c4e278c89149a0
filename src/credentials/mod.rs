//! Upstream credentials and their rotation.

pub mod rotation;
pub mod slots;

pub use rotation::{
    CredentialRotationManager, FailureInfo, KeyModelPair, RotationConfig, RotationStatus,
    SlotStatus,
};
pub use slots::{load_slots, Credential, CredentialEntry, CredentialSlot, CredentialSource};
