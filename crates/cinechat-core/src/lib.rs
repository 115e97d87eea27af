//! # cinechat-core
//!
//! Shared library for the CineChat chat-while-watching protocol.
//! Contains the domain types, the binary wire codec, stream frame
//! reassembly, the per-peer reliability engine, and configuration.
//!
//! This crate is used by both the server (`cinechatd`) and the terminal
//! client (`cinechat`). It performs no network I/O itself: the binaries
//! own the sockets and timers and drive the state machines defined here.

pub mod codec;
pub mod config;
pub mod framer;
pub mod reliability;
pub mod types;
