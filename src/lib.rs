//! Discovery, connection and ranging of UWB peers, split between a controller
//! and a host that talk over named message channels.

pub mod api;
pub mod codec;
pub mod config;
pub mod device_state;
pub mod error;
pub mod host;
pub mod messenger;
pub mod model;
pub mod radio;
