//! Lock-free Single-Producer Single-Consumer 帧环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者（数据回调路径）和消费者（后端消费路径）完全无锁操作
//! - 零分配：所有内存在 stream_init 时预分配，容量此后不可变
//! - 帧粒度：读写都以完整帧为单位，不会出现半帧
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 同一时刻只允许一个写者和一个读者。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// 最小容量（帧），避免极低延迟请求得到零长度缓冲区
pub const MIN_CAPACITY_FRAMES: usize = 64;

/// SPSC 无锁帧环形缓冲区
///
/// 内存布局保证：
/// - write_pos 和 read_pos 各自独占一个 cache line，避免 false sharing
/// - 读写位置是单调递增的帧计数，`write_pos - read_pos` 即为填充量
pub struct FrameRingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    frame_bytes: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl Send for FrameRingBuffer {}
unsafe impl Sync for FrameRingBuffer {}

impl FrameRingBuffer {
    /// 创建容量为 `capacity` 帧、每帧 `frame_bytes` 字节的缓冲区
    ///
    /// 容量低于 MIN_CAPACITY_FRAMES 时取下限
    pub fn new(capacity: usize, frame_bytes: usize) -> Self {
        assert!(frame_bytes > 0, "frame size must be non-zero");
        let capacity = capacity.max(MIN_CAPACITY_FRAMES);

        let buffer: Vec<UnsafeCell<u8>> = (0..capacity * frame_bytes)
            .map(|_| UnsafeCell::new(0))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            frame_bytes,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// 写入帧（生产者调用）
    ///
    /// `data` 长度必须是帧大小的整数倍。返回实际接受的帧数，
    /// 缓冲区快满时可能少于请求数。此函数是 wait-free 的，绝不阻塞。
    #[inline]
    pub fn write(&self, data: &[u8]) -> usize {
        debug_assert_eq!(data.len() % self.frame_bytes, 0, "partial frame written");

        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");

        let free = self.capacity - used;
        let to_write = (data.len() / self.frame_bytes).min(free);
        if to_write == 0 {
            return 0;
        }

        let start = write % self.capacity;
        let first = to_write.min(self.capacity - start);
        let second = to_write - first;

        unsafe {
            let base = self.base_ptr();
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                base.add(start * self.frame_bytes),
                first * self.frame_bytes,
            );
            if second > 0 {
                // 环绕到缓冲区头部
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first * self.frame_bytes),
                    base,
                    second * self.frame_bytes,
                );
            }
        }

        self.write_pos.store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// 读取帧（消费者调用）
    ///
    /// 最多读取 `output.len() / frame_bytes` 帧，返回实际读取的帧数。
    /// 此函数是 wait-free 的，绝不阻塞。
    #[inline]
    pub fn read(&self, output: &mut [u8]) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let available = write.wrapping_sub(read);
        let to_read = (output.len() / self.frame_bytes).min(available);
        if to_read == 0 {
            return 0;
        }

        let start = read % self.capacity;
        let first = to_read.min(self.capacity - start);
        let second = to_read - first;

        unsafe {
            let base = self.base_ptr();
            std::ptr::copy_nonoverlapping(
                base.add(start * self.frame_bytes),
                output.as_mut_ptr(),
                first * self.frame_bytes,
            );
            if second > 0 {
                std::ptr::copy_nonoverlapping(
                    base,
                    output.as_mut_ptr().add(first * self.frame_bytes),
                    second * self.frame_bytes,
                );
            }
        }

        self.read_pos.store(read.wrapping_add(to_read), Ordering::Release);
        to_read
    }

    /// 当前可读帧数
    #[inline]
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 当前可写帧数
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.available()
    }

    /// 容量（帧）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 每帧字节数
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// 填充比例（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.available() as f64 / self.capacity as f64
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.buffer.len();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        false
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::munlock(self.buffer.as_ptr() as *const libc::c_void, self.buffer.len());
        }

        log::debug!("Ring buffer memory unlocked");
    }
}

impl Drop for FrameRingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
