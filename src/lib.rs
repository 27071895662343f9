//! ysf2dmr: cross-mode gateway bridging System Fusion (YSF) and DMR.
//!
//! The gateway terminates a YSF node connection on one side and a DMR
//! master connection on the other, transcoding the vocoder sub-frames
//! between the two framings in real time. On top of the voice path it
//! implements the WIRES-X in-band control protocol (reflector browsing,
//! connect/disconnect, news board, message and picture upload/download),
//! DTMF shortcuts, and APRS position reporting.
//!
//! ## Modules
//!
//! - **ysf**: YSF wire protocol — FICH, payload channels, UDP endpoint
//! - **dmr**: DMR wire protocol — LC/EMB/slot type, master network client
//! - **convert**: the vocoder sub-frame converter between the two framings
//! - **wiresx**: WIRES-X command engine, talk-group registry, news storage
//! - **gateway**: the single-threaded bridge event loop

pub mod aprs;
pub mod bits;
pub mod config;
pub mod convert;
pub mod dmr;
pub mod dtmf;
pub mod fec;
pub mod gateway;
pub mod lookup;
pub mod timers;
pub mod wiresx;
pub mod xlx;
pub mod ysf;

/// Gateway version reported on the command line and to the DMR master.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
