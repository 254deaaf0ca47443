//! VMM 错误类型
//!
//! 可通过 [`VmError::to_errno()`] 转换为系统调用错误码。
//!
//! 内部一致性被破坏（页表描述符类型与记录不符、伙伴链表损坏等）不属于可返回的错误，
//! 由 [`vm_fatal!`](crate::vm_fatal) 打印诊断信息后停机。

use uapi::errno::{EACCES, EBUSY, EEXIST, EFAULT, EINVAL, EIO, ENOENT, ENOMEM};

/// VMM 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// 参数非法：未对齐、长度为零或越界 (-EINVAL)
    InvalidArgs,
    /// 地址处没有映射或区域 (-ENOENT)
    NotFound,
    /// 物理页或元数据分配失败 (-ENOMEM)
    NoMemory,
    /// 访问权限不匹配 (-EACCES)
    AccessDenied,
    /// 资源忙 (-EBUSY)
    Busy,
    /// 指定地址已被占用且不允许替换 (-EEXIST)
    AlreadyExists,
    /// 用户地址无法访问 (-EFAULT)
    Fault,
    /// 后备文件 I/O 失败，携带文件层返回的错误码 (-EIO 或原值)
    Io(i32),
}

impl VmError {
    /// 转换为系统调用错误码（负数）
    pub fn to_errno(&self) -> isize {
        let errno = match self {
            VmError::InvalidArgs => EINVAL,
            VmError::NotFound => ENOENT,
            VmError::NoMemory => ENOMEM,
            VmError::AccessDenied => EACCES,
            VmError::Busy => EBUSY,
            VmError::AlreadyExists => EEXIST,
            VmError::Fault => EFAULT,
            VmError::Io(0) => EIO,
            VmError::Io(e) => e.abs(),
        };
        -(errno as isize)
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::InvalidArgs => write!(f, "invalid arguments"),
            VmError::NotFound => write!(f, "no mapping found"),
            VmError::NoMemory => write!(f, "out of memory"),
            VmError::AccessDenied => write!(f, "access denied"),
            VmError::Busy => write!(f, "resource busy"),
            VmError::AlreadyExists => write!(f, "address already mapped"),
            VmError::Fault => write!(f, "bad user address"),
            VmError::Io(e) => write!(f, "backing file I/O error {}", e),
        }
    }
}

/// VMM 操作结果
pub type VmResult<T> = Result<T, VmError>;

/// 内部一致性被破坏时停机
///
/// 先用 `log::error!` 输出诊断信息，再 `panic!`。
#[macro_export]
macro_rules! vm_fatal {
    ($($arg:tt)*) => {{
        ::log::error!("vmm fatal: {}", format_args!($($arg)*));
        panic!("vmm fatal: {}", format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VmError::InvalidArgs.to_errno(), -22);
        assert_eq!(VmError::NoMemory.to_errno(), -12);
        assert_eq!(VmError::AccessDenied.to_errno(), -13);
        assert_eq!(VmError::AlreadyExists.to_errno(), -17);
        assert_eq!(VmError::Fault.to_errno(), -14);
        assert_eq!(VmError::Io(0).to_errno(), -5);
        assert_eq!(VmError::Io(-28).to_errno(), -28);
    }
}
