//! Device key material and signed public configurations.

pub mod configuration;
pub mod device;

pub use configuration::{
    KemOneTimePublicKey, OneTimePublicKey, SignedDeviceConfiguration, SignedKemOneTimePublicKey,
    SignedOneTimePublicKey, UserConfiguration, UserDeviceConfiguration, VerifiedDeviceBundle,
};
pub use device::{CurveOneTimeKey, DeviceKeys, KemOneTimeKey, KeyMaterialError};
