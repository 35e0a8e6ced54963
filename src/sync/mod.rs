// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// タスクコンテキストと割り込みコンテキストが共有するソフトウェア状態の保護
// ============================================================================

pub mod irq_mutex;

pub use irq_mutex::{
    install_interrupt_hooks, with_interrupts_disabled, InterruptHooks, IrqMutex, IrqMutexGuard,
};
