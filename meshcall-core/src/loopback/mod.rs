//! In-process simulation of the outside world
//!
//! A relay, peer connections and capture devices that live entirely in
//! memory. Tests and the demo binary use them to run whole calls between
//! several local users without a network, a camera or a browser.

mod devices;
mod peer;
mod relay;
mod user;

pub use devices::FakeMediaDevices;
pub use peer::{describe, LoopbackPeerConnection, LoopbackPeerFactory};
pub use relay::{LoopbackRelay, LoopbackTransport};
pub use user::LoopbackUser;
