//! TUN 透明代理

pub mod device;
pub mod enhancer;
pub mod handler;

pub use device::TunConfig;
pub use enhancer::Enhancer;
pub use handler::TunHandler;
