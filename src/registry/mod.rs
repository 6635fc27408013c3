//! Destinations and client registrations loaded from configuration.

pub mod client;
pub mod destinations;

pub use client::{
    ClientLine, ClientRegistration, ClientRegistry, LivenessView, LivenessWriter, TimeoutPolicy,
};
pub use destinations::{Destination, DestinationBook};
