//! Handclap: toggle smart lights by clapping.
//!
//! Two independent services make up the core:
//! - [`audio::detector::ClapDetector`] listens to the microphone and raises a
//!   debounced clap event when loudness crosses a threshold.
//! - [`bridge::BridgeClient`] discovers and pairs with a local lighting bridge
//!   and switches its lights on or off.
//!
//! Neither knows about the other; the shell in `main.rs` forwards claps to
//! the bridge client.

pub mod audio;
pub mod bridge;
pub mod config;
pub mod paths;
pub mod shell;
pub mod storage;
pub mod validation;
