//! 文件相关的 Mock 实现
//!
//! 注意：这里不直接依赖 `vmm` crate（避免循环依赖）。
//! `vmm` 在 `cfg(test)` 下为这些类型实现其 `MmInode` trait。

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::hint;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 一次写回记录：`(偏移, 长度)`
pub type WriteRecord = (usize, usize);

struct Inner {
    data: Vec<u8>,
    writes: Vec<WriteRecord>,
}

/// 内存中的文件内容，记录所有写入
pub struct MockFileData {
    ino: u64,
    locked: AtomicBool,
    reads: AtomicUsize,
    inner: UnsafeCell<Inner>,
}

// SAFETY: inner 只在持有 locked 时访问
unsafe impl Sync for MockFileData {}
unsafe impl Send for MockFileData {}

impl MockFileData {
    pub fn new(ino: u64, data: &[u8]) -> Self {
        Self {
            ino,
            locked: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            inner: UnsafeCell::new(Inner {
                data: data.to_vec(),
                writes: Vec::new(),
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        // SAFETY: 已持有 locked
        let r = f(unsafe { &mut *self.inner.get() });
        self.locked.store(false, Ordering::Release);
        r
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn size(&self) -> usize {
        self.with(|i| i.data.len())
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.with(|i| {
            if offset >= i.data.len() {
                return 0;
            }
            let n = buf.len().min(i.data.len() - offset);
            buf[..n].copy_from_slice(&i.data[offset..offset + n]);
            n
        })
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        self.with(|i| {
            let end = offset + buf.len();
            if i.data.len() < end {
                i.data.resize(end, 0);
            }
            i.data[offset..end].copy_from_slice(buf);
            i.writes.push((offset, buf.len()));
            buf.len()
        })
    }

    /// 文件当前内容的拷贝
    pub fn contents(&self) -> Vec<u8> {
        self.with(|i| i.data.clone())
    }

    /// 迄今为止的写入记录
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.with(|i| i.writes.clone())
    }

    /// 读取次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}
