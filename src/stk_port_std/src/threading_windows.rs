//! Threading layer similar to `std::thread` but supporting the *remote
//! park* operation, implemented with `SuspendThread`.
use std::{
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicIsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
};
use winapi::um::{
    errhandlingapi, handleapi, processthreadsapi, synchapi,
    winbase::INFINITE,
    winnt::{DUPLICATE_SAME_ACCESS, HANDLE},
};

/// Spawn a new thread.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> Thread {
    let (send, recv) = mpsc::channel();

    thread::spawn(move || {
        let _ = send.send(THREAD_DATA.with(Arc::clone));
        f()
    });

    Thread {
        data: recv.recv().unwrap(),
    }
}

thread_local! {
    static THREAD_DATA: Arc<ThreadData> = Arc::new(ThreadData {
        token_count: AtomicIsize::new(0),
        hthread: current_hthread(),
        remote_op_mutex: Mutex::new(()),
    });
}

/// Handle to a thread created by [`spawn`].
#[derive(Clone)]
pub struct Thread {
    data: Arc<ThreadData>,
}

struct ThreadData {
    /// Park-token balance; negative while the thread is parked.
    token_count: AtomicIsize,
    hthread: HANDLE,
    /// Serializes remote operations against each other.
    remote_op_mutex: Mutex<()>,
}

unsafe impl Send for ThreadData {}
unsafe impl Sync for ThreadData {}

/// Block the current thread until a park token arrives.
pub fn park() {
    THREAD_DATA.with(|td| {
        let token_count_cell = &td.token_count;
        let mut token_count = token_count_cell.fetch_sub(1, Ordering::Relaxed) - 1;
        while token_count < 0 {
            unsafe {
                synchapi::WaitOnAddress(
                    token_count_cell.as_ptr().cast(),        // location to watch
                    core::ptr::addr_of!(token_count) as _,   // undesired value
                    std::mem::size_of::<isize>(),            // value size
                    INFINITE,                                // timeout
                );
            }
            token_count = token_count_cell.load(Ordering::Relaxed);
        }
    })
}

impl Thread {
    /// Make a new park token available for the thread. A thread can hold
    /// multiple tokens; each call to `park` consumes one.
    pub fn unpark(&self) {
        let _guard = self.data.remote_op_mutex.lock().unwrap();
        let token_count_cell = &self.data.token_count;
        if token_count_cell.fetch_add(1, Ordering::Relaxed) == -1 {
            unsafe { synchapi::WakeByAddressAll(token_count_cell.as_ptr() as _) };
            unsafe { processthreadsapi::ResumeThread(self.data.hthread) };
        }
    }

    /// Force the thread to park, wherever it is currently executing.
    ///
    /// Returns once the target thread stopped running. The result is
    /// unspecified if the thread has already exited.
    pub fn park_remote(&self) {
        let _guard = self.data.remote_op_mutex.lock().unwrap();
        let token_count_cell = &self.data.token_count;
        if token_count_cell.fetch_sub(1, Ordering::Relaxed) == 0 {
            unsafe { processthreadsapi::SuspendThread(self.data.hthread) };

            // wait for the suspend request to actually complete
            unsafe {
                processthreadsapi::GetThreadContext(
                    self.data.hthread,
                    MaybeUninit::uninit().as_mut_ptr(),
                );
            }
        }
    }
}

fn current_hthread() -> HANDLE {
    // pseudo handle, converted to a real one by `DuplicateHandle`
    let cur_pseudo_hthread = unsafe { processthreadsapi::GetCurrentThread() };

    let cur_hprocess = unsafe { processthreadsapi::GetCurrentProcess() };
    let mut cur_hthread = MaybeUninit::uninit();
    let ok = unsafe {
        handleapi::DuplicateHandle(
            cur_hprocess,
            cur_pseudo_hthread,
            cur_hprocess,
            cur_hthread.as_mut_ptr(),
            0, // desired access, ignored because of `DUPLICATE_SAME_ACCESS`
            0, // do not inherit
            DUPLICATE_SAME_ACCESS,
        )
    };
    if ok == 0 {
        panic!("Win32 error 0x{:08x}", unsafe {
            errhandlingapi::GetLastError()
        });
    }
    unsafe { cur_hthread.assume_init() }
}
