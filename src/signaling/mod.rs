//! Signaling Module - SIP über WebSocket
//!
//! Dieses Modul kapselt alles, was mit dem Signaling-Server spricht:
//! - Schnittstellen zum SIP/WebRTC Stack (`stack`)
//! - Erreichbarkeitstest des Endpunkts (`probe`)
//! - SIP Nachrichten und Digest-Auth (`message`)
//! - Konkreter Stack über WebSocket (`ws`)
//!

mod message;
mod probe;
mod stack;
mod ws;

pub use message::{DigestChallenge, Method, SipMessage, SipRequest, SipResponse};
pub use probe::{ConnectivityProbe, WsProbe};
pub use stack::*;
pub use ws::{sip_ws_request, WsSignaling, WsUserAgent};
