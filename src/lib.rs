//! Session-layer protocol engine for connection-oriented, reliable,
//! in-order messaging over UDP.
//!
//! The two entry points are [`manager::ConnectionManager`], which owns a
//! single UDP socket and multiplexes many peers onto it, and
//! [`connection::Connection`], the per-peer state machine it drives.

pub mod budget;
pub mod coalesce;
pub mod config;
pub mod connection;
pub mod crc;
pub mod cursor;
pub mod encode;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod loss;
pub mod manager;
pub mod opcode;
pub mod rtt;
pub mod seq;
pub mod stats;
pub mod status;
pub mod stream;

pub use {
    config::ConnectionManagerOptions,
    connection::Connection,
    error::{DecodeError, FramingError, ReassembleError},
    manager::ConnectionManager,
    status::ConnectionStatus,
};
