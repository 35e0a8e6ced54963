// ============================================================================
// src/sync/irq_mutex.rs - 割り込み禁止Mutex
//
// 問題: spin::Mutex はロック中でも割り込みを許可する
// → 割り込みハンドラ（完了処理）が同じMutexをロックしようとするとデッドロック
//
// 解決: ロック取得時に割り込みを禁止し、解放時に元の状態へ復元する。
//       割り込み禁止/復元の実体はOS側がフックとして登録する
//       （アーキテクチャ非依存、ホスト上のテストではフック無しで動作）。
//
// 参考: Linux の spin_lock_irqsave / spin_unlock_irqrestore
// ============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// 割り込み制御フック
#[derive(Clone, Copy)]
pub struct InterruptHooks {
    /// 割り込みを禁止し、直前に有効だったかを返す
    pub save_and_disable: fn() -> bool,
    /// 割り込みを復元（元々有効だった場合のみ有効化）
    pub restore: fn(bool),
}

static HOOKS: spin::Once<InterruptHooks> = spin::Once::new();

/// 割り込み制御フックを登録（最初の1回のみ有効）
pub fn install_interrupt_hooks(hooks: InterruptHooks) {
    HOOKS.call_once(|| hooks);
}

#[inline]
fn save_and_disable_interrupts() -> bool {
    match HOOKS.get() {
        Some(hooks) => (hooks.save_and_disable)(),
        None => false,
    }
}

#[inline]
fn restore_interrupts(was_enabled: bool) {
    if let Some(hooks) = HOOKS.get() {
        (hooks.restore)(was_enabled);
    }
}

/// 割り込み禁止Mutex
///
/// ロック取得時に自動的に割り込みを禁止し、
/// ロック解放時に元の状態に復元する。
///
/// # 割り込みハンドラからの使用
/// 割り込みハンドラ内でこのMutexをロックしても、
/// タスク側は割り込み禁止中にしか保持しないため、デッドロックしない。
pub struct IrqMutex<T: ?Sized> {
    /// スピンロック本体
    locked: AtomicBool,
    /// 保護されるデータ
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex は排他的アクセスを保証する
unsafe impl<T: ?Sized + Send> Sync for IrqMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqMutex<T> {}

impl<T> IrqMutex<T> {
    /// 新しい IrqMutex を作成
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// ロックを取得
    ///
    /// 割り込みを禁止してからスピンロックを取得する。
    /// ガードがドロップされると自動的に割り込みが復元される。
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq_was_enabled = save_and_disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqMutexGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// ロックを試行（失敗したら即座に返る）
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq_was_enabled = save_and_disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            restore_interrupts(irq_was_enabled);
            None
        }
    }
}

/// IrqMutex のガード
///
/// ドロップ時にロックを解放し、割り込み状態を復元する。
pub struct IrqMutexGuard<'a, T: ?Sized> {
    lock: &'a IrqMutex<T>,
    irq_was_enabled: bool,
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_interrupts(self.irq_was_enabled);
    }
}

/// 割り込みを禁止した状態で処理を実行
///
/// ロックは不要だが、割り込みを一時的に禁止したい場合に使用。
pub fn with_interrupts_disabled<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = save_and_disable_interrupts();
    let result = f();
    restore_interrupts(was_enabled);
    result
}
