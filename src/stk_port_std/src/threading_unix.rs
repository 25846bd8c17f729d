//! Threading layer similar to `std::thread` but supporting the *remote
//! park* operation: forcing another thread to stop running at an arbitrary
//! point, which is what preemption looks like on a hosted target.
//!
//! A park token is a byte in a socketpair. `park` blocks reading a token;
//! `unpark` writes one. A remote park raises `SIGUSR1` on the target
//! thread, whose signal handler then parks in place until a token
//! arrives.
use std::{
    cell::Cell,
    mem::MaybeUninit,
    os::raw::c_int,
    ptr::null_mut,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    thread,
};

/// Spawn a new thread.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> Thread {
    let data = Arc::new(ThreadData::new());
    let data2 = Arc::clone(&data);

    let (ready_send, ready_recv) = std::sync::mpsc::channel();

    thread::spawn(move || {
        data2.set_self();
        CURRENT_DATA.with(|c| c.set(Arc::into_raw(Arc::clone(&data2)) as *const ThreadData));
        ready_send.send(()).unwrap();

        f();

        // Release the `Arc` reference moved into the thread local.
        let ptr = CURRENT_DATA.with(|c| c.replace(core::ptr::null()));
        if !ptr.is_null() {
            unsafe { drop(Arc::from_raw(ptr)) };
        }
    });

    // Wait until the just-spawned thread configures its `ThreadData`.
    ready_recv.recv().unwrap();

    Thread { data }
}

thread_local! {
    static CURRENT_DATA: Cell<*const ThreadData> = const { Cell::new(core::ptr::null()) };
}

/// Handle to a thread created by [`spawn`].
#[derive(Clone)]
pub struct Thread {
    data: Arc<ThreadData>,
}

struct ThreadData {
    /// `[0]` is read by `park`, `[1]` is written by `unpark`.
    park_sock: [c_int; 2],
    /// Number of outstanding remote-park requests.
    park_count: AtomicUsize,
    /// `pthread_t` of the thread, for `pthread_kill`.
    pthread_id: AtomicUsize,
}

impl ThreadData {
    fn new() -> Self {
        let park_sock = unsafe {
            let mut park_sock = MaybeUninit::<[c_int; 2]>::uninit();
            ok_or_errno(libc::socketpair(
                libc::PF_LOCAL,
                libc::SOCK_STREAM,
                0,
                park_sock.as_mut_ptr() as _,
            ))
            .expect("socketpair failed");
            park_sock.assume_init()
        };

        Self {
            park_sock,
            park_count: AtomicUsize::new(0),
            pthread_id: AtomicUsize::new(0),
        }
    }

    fn set_self(&self) {
        self.pthread_id
            .store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.park_sock[0]);
            libc::close(self.park_sock[1]);
        }
    }
}

/// Block the current thread until a park token arrives.
pub fn park() {
    let data_ptr = CURRENT_DATA.with(|c| c.get());
    assert!(!data_ptr.is_null(), "not a thread created by `spawn`");
    park_inner(unsafe { &*data_ptr });
}

fn park_inner(data: &ThreadData) {
    loop {
        // take a token (blocking)
        match isize_ok_or_errno(unsafe {
            libc::recv(data.park_sock[0], (&mut 0u8) as *mut _ as _, 1, 0)
        }) {
            Ok(1) => break,
            // spurious wakeup or interrupted; try again
            Ok(0) | Err(errno::Errno(libc::EAGAIN)) | Err(errno::Errno(libc::EINTR)) => continue,
            Ok(i) => panic!("unexpected recv return value: {i}"),
            Err(e) => panic!("failed to take a park token: {e}"),
        }
    }
}

impl Thread {
    /// Make a new park token available for the thread. A thread can hold
    /// multiple tokens; each call to `park` consumes one.
    pub fn unpark(&self) {
        isize_ok_or_errno(unsafe {
            libc::send(self.data.park_sock[1], &0u8 as *const _ as _, 1, 0)
        })
        .expect("failed to post a park token");
    }

    /// Force the thread to park, wherever it is currently executing.
    ///
    /// Returns once the target thread stopped running. The result is
    /// unspecified if the thread has already exited.
    pub fn park_remote(&self) {
        static SIGNAL_HANDLER_ONCE: Once = Once::new();
        SIGNAL_HANDLER_ONCE.call_once(register_remote_park_signal_handler);

        let pthread_id = self.data.pthread_id.load(Ordering::Relaxed);

        self.data.park_count.fetch_add(1, Ordering::Relaxed);

        // force the target thread into `remote_park_signal_handler`
        ok_or_errno(unsafe { libc::pthread_kill(pthread_id as libc::pthread_t, SIGNAL_REMOTE_PARK) })
            .expect("pthread_kill failed");

        // wait until the signal is delivered
        while self.data.park_count.load(Ordering::Relaxed) != 0 {
            thread::yield_now();
        }
    }
}

const SIGNAL_REMOTE_PARK: c_int = libc::SIGUSR1;

#[cold]
fn register_remote_park_signal_handler() {
    ok_or_errno(unsafe {
        libc::sigaction(
            SIGNAL_REMOTE_PARK,
            &libc::sigaction {
                sa_sigaction: remote_park_signal_handler as libc::sighandler_t,
                sa_flags: libc::SA_SIGINFO,
                ..std::mem::zeroed()
            },
            null_mut(),
        )
    })
    .expect("sigaction failed");

    extern "C" fn remote_park_signal_handler(
        _signo: c_int,
        _: *mut libc::siginfo_t,
        _: *mut libc::c_void,
    ) {
        let data_ptr = CURRENT_DATA.with(|c| c.get());
        assert!(!data_ptr.is_null());
        let data = unsafe { &*data_ptr };

        while data.park_count.load(Ordering::Relaxed) != 0 {
            data.park_count.fetch_sub(1, Ordering::Relaxed);

            // park right here, in the signal handler
            park_inner(data);
        }
    }
}

fn isize_ok_or_errno(x: isize) -> Result<isize, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

fn ok_or_errno(x: c_int) -> Result<c_int, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn unpark_token_wakes_park() {
        static RAN: AtomicBool = AtomicBool::new(false);
        let th = spawn(|| {
            park();
            RAN.store(true, Ordering::Relaxed);
        });
        assert!(!RAN.load(Ordering::Relaxed));
        th.unpark();
        std::thread::sleep(Duration::from_millis(200));
        assert!(RAN.load(Ordering::Relaxed));
    }

    #[test]
    fn remote_park_stops_a_spinning_thread() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let th = spawn(|| loop {
            COUNTER.fetch_add(1, Ordering::Relaxed);
        });

        std::thread::sleep(Duration::from_millis(50));
        th.park_remote();

        let stopped_at = COUNTER.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(COUNTER.load(Ordering::Relaxed), stopped_at);

        th.unpark();
        std::thread::sleep(Duration::from_millis(50));
        assert!(COUNTER.load(Ordering::Relaxed) > stopped_at);
    }
}
