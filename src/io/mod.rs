// ============================================================================
// I/O Subsystem Module
// ホストコントローラドライバ群
// ============================================================================
pub mod usb;
