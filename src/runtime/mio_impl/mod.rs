//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! All registry and broadcast work happens on the loop thread, so no
//! locking is involved.

mod event_loop;

pub use event_loop::EventLoop;
