//! Wire-level cryptography for the Shadowsocks transport.

pub mod shadowsocks;

pub use shadowsocks::{CipherKind, ShadowsocksConnection};
