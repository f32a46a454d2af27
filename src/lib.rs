// apnkit - Apple push notifications over the legacy binary gateway
//
// Builds notification payloads, frames them for Apple's gateway, delivers
// pending notifications per application credential, and prunes devices
// reported by the feedback service.

// Re-export core functionality
pub use apnkit_push::*;

// Re-export optional crates
#[cfg(feature = "config")]
pub use apnkit_config;

#[cfg(feature = "log")]
pub use apnkit_log;

// Prelude for common imports
pub mod prelude {
    pub use apnkit_push::prelude::*;

    #[cfg(feature = "config")]
    pub use apnkit_config::{ConfigManager, Validate};
}
