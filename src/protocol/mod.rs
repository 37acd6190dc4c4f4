//! 协议模块
//!
//! 地址编解码、本地入站协议（SOCKS5、HTTP 代理）以及连接抽象。

pub mod address;
pub mod http;
pub mod socks5;
pub mod traits;

pub use address::{Address, AddressError, AddressType};
pub use traits::{AsyncReadWrite, BoxStream, PacketConn, PrefixedStream, SharedPacketConn};
