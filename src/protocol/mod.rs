//! Wire-level message formats and signing discipline.

pub mod wire;

pub use wire::{
    RatchetMessage, SignedRatchetMessage, SignedRatchetMessageMetadata,
    SynchronizationKeyIdentities, WireError,
};
