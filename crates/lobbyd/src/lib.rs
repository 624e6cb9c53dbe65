//! lobbyd — reception-kiosk recognition and broadcast daemon.
//!
//! Frames arrive from interactive sessions, a local camera or a network
//! stream; faces are matched against the enrolled gallery and recognitions
//! are fanned out to every connected display.

pub mod activation;
pub mod config;
pub mod dbus_interface;
pub mod directory;
pub mod pipeline;
pub mod runtime;
pub mod settings;
pub mod streams;
pub mod subscribers;
pub mod supervisor;
pub mod transport;
pub mod vision;

pub use runtime::{Runtime, RuntimeParts};

/// Well-known bus name and object path of the daemon.
pub const BUS_NAME: &str = "io.lobby.Lobby1";
pub const OBJECT_PATH: &str = "/io/lobby/Lobby1";
