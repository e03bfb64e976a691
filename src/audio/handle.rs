//! 原子引用计数句柄
//!
//! 对象内嵌自己的引用计数（intrusive），通过 `add_ref` / `release` 两个自由函数维护。
//!
//! - `Ref<T>`：强引用，持有一个计数，可 `Deref`
//! - `Handle<T>`：可被多个线程同时读取、替换的原子槽位
//!
//! 替换槽位时，旧对象的那个引用要等所有正在进行中的 `load()` 取完引用后才释放，
//! 因此任何线程都不会读到已经销毁的对象。`load()` 本身从不等待。

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// 内嵌的原子引用计数
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// 当前计数（仅用于诊断和测试）
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

/// 内嵌引用计数的对象
///
/// # Safety
///
/// `ref_count()` 必须始终返回同一个计数器，且该计数器只由本模块修改。
pub unsafe trait RefCounted: Send + Sync {
    fn ref_count(&self) -> &RefCount;
}

/// 增加一个引用
#[inline]
pub fn add_ref<T: RefCounted>(obj: &T) {
    let old = obj.ref_count().0.fetch_add(1, Ordering::Relaxed);
    debug_assert!(old < usize::MAX / 2, "reference count overflow");
}

/// 释放一个引用，计数归零时销毁对象
///
/// # Safety
///
/// `ptr` 必须来自 `Ref::new` 分配的对象，且调用者确实持有它的一个引用。
#[inline]
pub unsafe fn release<T: RefCounted>(ptr: NonNull<T>) {
    let old = ptr.as_ref().ref_count().0.fetch_sub(1, Ordering::Release);
    debug_assert!(old > 0, "release on a dead object");
    if old == 1 {
        // 与其它线程的 Release 减计数配对，保证销毁前看到它们的全部写入
        fence(Ordering::Acquire);
        drop(Box::from_raw(ptr.as_ptr()));
    }
}

/// 强引用
pub struct Ref<T: RefCounted> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: RefCounted> Send for Ref<T> {}
unsafe impl<T: RefCounted> Sync for Ref<T> {}

impl<T: RefCounted> Ref<T> {
    /// 在堆上创建对象，返回它的第一个引用
    pub fn new(value: T) -> Self {
        debug_assert_eq!(value.ref_count().get(), 0, "object already referenced");
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(value))) };
        add_ref(unsafe { ptr.as_ref() });
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// 接管一个已经计入的引用
    unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// 交出引用，不释放
    fn into_raw(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        std::mem::forget(this);
        ptr
    }

    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// 当前引用数
    pub fn ref_count(this: &Self) -> usize {
        this.ref_count().get()
    }
}

impl<T: RefCounted> Clone for Ref<T> {
    fn clone(&self) -> Self {
        add_ref(self.deref());
        unsafe { Self::from_raw(self.ptr) }
    }
}

impl<T: RefCounted> Drop for Ref<T> {
    fn drop(&mut self) {
        unsafe { release(self.ptr) }
    }
}

impl<T: RefCounted> Deref for Ref<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.deref(), f)
    }
}

/// 原子句柄
///
/// 槽位本身持有所指对象的一个引用。空句柄是合法的惰性状态。
///
/// `load` 无锁且不等待。写操作（`store` / `reset` / `exchange` /
/// 成功的 `compare_and_swap`）换出旧指针后要自旋等待进行中的 `load`
/// 加完引用，所以不是严格无锁：一个在"读指针 → 加引用"窗口内被抢占的 `load`
/// 会拖住所有写者，直到它重新被调度。不要在实时回调里写句柄。
pub struct Handle<T: RefCounted> {
    ptr: AtomicPtr<T>,
    /// 正处于"读指针 → 加引用"窗口中的 load 数量
    readers: CachePadded<AtomicUsize>,
    _marker: PhantomData<T>,
}

unsafe impl<T: RefCounted> Send for Handle<T> {}
unsafe impl<T: RefCounted> Sync for Handle<T> {}

impl<T: RefCounted> Handle<T> {
    /// 空句柄
    pub const fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            readers: CachePadded::new(AtomicUsize::new(0)),
            _marker: PhantomData,
        }
    }

    /// 创建对象并放入新句柄
    pub fn new(value: T) -> Self {
        Self::from_ref(Some(Ref::new(value)))
    }

    pub fn from_ref(value: Option<Ref<T>>) -> Self {
        let handle = Self::null();
        if let Some(r) = value {
            handle.ptr.store(Ref::into_raw(r).as_ptr(), Ordering::Release);
        }
        handle
    }

    /// 取出当前对象的强引用
    ///
    /// 不会阻塞，可以在任何线程调用。
    pub fn load(&self) -> Option<Ref<T>> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        let current = NonNull::new(self.ptr.load(Ordering::SeqCst)).map(|p| {
            // 旧对象在 readers 归零前不会被释放，这里加引用是安全的
            add_ref(unsafe { p.as_ref() });
            unsafe { Ref::from_raw(p) }
        });
        self.readers.fetch_sub(1, Ordering::Release);
        current
    }

    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    /// 原子替换，返回旧对象（槽位原来持有的引用转交给返回值）
    pub fn exchange(&self, value: Option<Ref<T>>) -> Option<Ref<T>> {
        let new_ptr = value.map_or(ptr::null_mut(), |r| Ref::into_raw(r).as_ptr());
        let old = self.ptr.swap(new_ptr, Ordering::SeqCst);
        self.wait_for_readers();
        NonNull::new(old).map(|p| unsafe { Ref::from_raw(p) })
    }

    /// 原子替换并释放旧对象
    pub fn store(&self, value: Option<Ref<T>>) {
        drop(self.exchange(value));
    }

    /// 清空句柄
    pub fn reset(&self) {
        self.store(None);
    }

    /// 仅当槽位当前指向 `expected` 时替换为 `desired`
    ///
    /// 成功时槽位接管 `desired` 的引用并释放 `expected` 的那个引用；
    /// 失败时槽位不变，`desired` 正常释放。
    pub fn compare_and_swap(&self, expected: Option<&Ref<T>>, desired: Option<Ref<T>>) -> bool {
        let expected_ptr = expected.map_or(ptr::null_mut(), |r| r.ptr.as_ptr());
        let desired_ptr = desired.as_ref().map_or(ptr::null_mut(), |r| r.ptr.as_ptr());

        match self.ptr.compare_exchange(
            expected_ptr,
            desired_ptr,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(old) => {
                if let Some(r) = desired {
                    Ref::into_raw(r);
                }
                self.wait_for_readers();
                if let Some(p) = NonNull::new(old) {
                    unsafe { release(p) };
                }
                true
            }
            Err(_) => false,
        }
    }

    /// 是否指向同一对象
    pub fn ptr_eq(&self, other: Option<&Ref<T>>) -> bool {
        let current = self.ptr.load(Ordering::Acquire);
        current == other.map_or(ptr::null_mut(), |r| r.ptr.as_ptr())
    }

    /// 等待所有已读到旧指针的 load 完成加引用
    fn wait_for_readers(&self) {
        let backoff = Backoff::new();
        while self.readers.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }
}

impl<T: RefCounted> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self::from_ref(self.load())
    }
}

impl<T: RefCounted> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: RefCounted> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Some(p) = NonNull::new(*self.ptr.get_mut()) {
            unsafe { release(p) };
        }
    }
}

impl<T: RefCounted> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("ptr", &self.ptr.load(Ordering::Relaxed))
            .finish()
    }
}
