//! Synchronization primitives for task coordination and resource
//! protection.
//!
//! # ISR safety
//!
//! Methods that can block the caller are **strictly forbidden** in
//! interrupt service routines:
//!
//! | Primitive             | ISR-safe methods                               |
//! |-----------------------|------------------------------------------------|
//! | [`Event`]             | `set`, `pulse`, `reset`, `try_wait`            |
//! | [`Semaphore`]         | `signal`                                       |
//! | [`SpinLock`]          | none                                           |
//! | [`Mutex`]             | none                                           |
//! | [`ConditionVariable`] | `notify_one`, `notify_all`                     |
//! | [`Pipe`]              | none                                           |
//!
//! `SpinLock` and `Mutex` tie ownership to a task id, which does not exist
//! in an ISR; `Pipe` uses an internal mutex. In debug builds an assertion
//! fires when an ineligible method is called from an ISR.
pub mod wait;

mod condvar;
mod cs;
mod event;
mod mutex;
mod pipe;
mod rwmutex;
mod semaphore;
mod spinlock;

pub use self::condvar::ConditionVariable;
pub use self::cs::ScopedCriticalSection;
pub use self::event::Event;
pub use self::mutex::Mutex;
pub use self::pipe::Pipe;
pub use self::rwmutex::RwMutex;
pub use self::semaphore::Semaphore;
pub use self::spinlock::SpinLock;
