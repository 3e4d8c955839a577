//! # mdrd — Sony MDR protocol bridge to D-Bus
//!
//! `mdrd` is a userspace daemon that registers itself as a BlueZ RFCOMM
//! profile for Sony's MDR proprietary protocol, and republishes every
//! connected headphone's capabilities (battery, noise cancelling, ambient
//! sound mode, equaliser, ...) as `org.mdr` objects on the D-Bus system bus.
//!
//! It owns no user-facing surface of its own: no CLI, no configuration file,
//! no persisted state. Everything it knows about a device is rediscovered
//! from the device itself each time BlueZ hands it a connection.
//!
//! ## Module map
//! * [codec] — MDR frame encoding/decoding and byte-stuffing.
//! * [link] — retransmission and acknowledgement over one RFCOMM stream.
//! * [dispatcher] — correlates application-layer requests with replies.
//! * [registry] — capability handshake.
//! * [surface] — the generic capability-surface template and its twelve
//!   instantiations.
//! * [bus] — D-Bus object export.
//! * [profile] — BlueZ `Profile1`/`ProfileManager1` registration.
//! * [session] — per-device state machine tying the above together.
//! * [daemon] — process wiring and the accept loop.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("mdrd only supports the Linux operating system.");

pub mod address;
pub mod bus;
pub mod codec;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod io;
pub mod link;
pub mod profile;
pub mod registry;
pub mod session;
pub mod surface;

pub use address::Address;
pub use error::{Error, ErrorKind, Result};
