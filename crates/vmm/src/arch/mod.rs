//! 架构相关的页表驱动
//!
//! 目前只有 ARMv6/v7 短描述符格式的实现。

pub mod arm;

pub use arm::{ArchMmu, MmuFlags};
