//! Kisan Live - live voice and chat client for the Kisan farmer assistant
//!
//! The voice side streams microphone audio to a live inference service over
//! a WebSocket and plays the synthesized reply back in order. The chat side
//! delivers typed questions over HTTP when online and falls back to an SMS
//! deep link when not.

#![forbid(unsafe_code)]

pub mod audio;
pub mod capture;
pub mod config;
pub mod connectivity;
pub mod conversation;
pub mod error;
pub mod events;
pub mod live_client;
pub mod playback;
pub mod protocol;
pub mod recorder;
pub mod router;
pub mod streamer;
pub mod transport;
pub mod voice_session;
pub mod wav;

pub use error::LiveError;
