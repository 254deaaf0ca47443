//! Mock 实现模块
//!
//! 提供架构、物理内存和文件的 Mock 实现，用于测试

pub mod arch;
pub mod fs;
pub mod mm;
