//! Exclusion strategies, one per concurrency mode in spec §5.
//!
//! The teacher crate picks its mutex strategy per-target inside
//! `global/unix.rs` (a raw `libc::pthread_mutex_t` behind a process-local
//! `static`). That doesn't fit here: spec §5 mode 3 needs the mutex (and a
//! condvar) to live *inside* the shared region itself, since there is no
//! process-local `static` that every attacher can see. So instead of
//! branching on target, this module exposes one [`SyncPolicy`] trait with
//! three implementors that a [`Control`](crate::control::Control) is generic
//! over, the same shape as the teacher's `GlobalTlsfOptions` type-parameter
//! pattern in `global.rs`.
//!
//! All attachers of a given shared region must agree on the concrete
//! [`SyncPolicy`] they instantiate `Control` with — it's part of the region's
//! binary layout, exactly like the teacher's requirement that a
//! `GlobalTlsf<Options>`'s `Options` be fixed for the lifetime of the
//! allocator.

use crate::init::Init;

/// A mutual-exclusion (and, for cooperating processes, condition-variable)
/// strategy embeddable directly inside a [`Control`](crate::control::Control).
///
/// # Safety
///
/// Implementors must ensure `lock`/`unlock` provide the mutual exclusion
/// their mode promises: for [`NoSync`] that's an upheld-by-the-caller
/// invariant (single-threaded use), for [`Spinlock`] it's a real atomic
/// exclusion within one process, and for [`SharedMutex`] across processes
/// too.
pub unsafe trait SyncPolicy: Init {
    /// Acquire the lock, blocking the calling thread if necessary.
    fn lock(&self);

    /// Release a previously acquired lock.
    ///
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn unlock(&self);

    /// Whether this policy supports the blocking-on-exhaustion semantics of
    /// spec §5 mode 3. When `false`, [`Self::wait`]/[`Self::notify`] are
    /// never called.
    const BLOCKING: bool = false;

    /// Atomically release the lock and block until [`Self::notify`] is
    /// called elsewhere, then reacquire the lock before returning.
    ///
    /// # Safety
    /// The caller must currently hold the lock. Default implementation
    /// panics; only called when [`Self::BLOCKING`] is `true`.
    unsafe fn wait(&self) {
        unreachable!("wait() called on a non-blocking SyncPolicy");
    }

    /// Wake every waiter blocked in [`Self::wait`].
    ///
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn notify(&self) {}

    /// One-time upgrade a freshly [`Init::INIT`]ed instance needs before it's
    /// safe to share with other attachers, if any (spec §5: "the Control's
    /// mutex/condvar are initialized exactly once by the first attacher").
    /// [`NoSync`] and [`Spinlock`] need nothing here; [`SharedMutex`]
    /// installs `PTHREAD_PROCESS_SHARED` on its primitives.
    ///
    /// # Safety
    /// Must be called exactly once, by the first attacher, before any other
    /// participant calls [`Self::lock`] on this instance.
    unsafe fn init_shared(&self) {}
}

/// Mode 1 (spec §5): single-threaded, single-process. No locking at all;
/// the embedder is responsible for serializing access.
#[derive(Debug, Default)]
pub struct NoSync(());

impl Init for NoSync {
    const INIT: Self = Self(());
}

unsafe impl SyncPolicy for NoSync {
    #[inline]
    fn lock(&self) {}

    #[inline]
    unsafe fn unlock(&self) {}
}

/// Mode 2 (spec §5): multi-threaded, single process. A plain
/// compare-and-swap spinlock — this never needs to survive a process
/// boundary, so unlike [`SharedMutex`] it needs no OS-backed primitive and
/// no `libc` dependency.
#[derive(Debug, Default)]
pub struct Spinlock(core::sync::atomic::AtomicBool);

impl Init for Spinlock {
    const INIT: Self = Self(core::sync::atomic::AtomicBool::new(false));
}

unsafe impl SyncPolicy for Spinlock {
    #[inline]
    fn lock(&self) {
        use core::sync::atomic::Ordering;
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.0.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.0.store(false, core::sync::atomic::Ordering::Release);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Mode 3 (spec §5): multi-process, shared region. A
        /// `PTHREAD_PROCESS_SHARED` mutex and condition variable, laid out
        /// inline so they live in the shared region itself rather than in a
        /// process-local `static` (contrast with the teacher's
        /// `global/unix.rs`, whose `Mutex` guards a single process's global
        /// allocator and can therefore be a `static`).
        ///
        /// Mirrors `original_source/vcalloc/control.h`'s `ControlHeader::Init`,
        /// which calls `pthread_mutexattr_setpshared`/`pthread_condattr_setpshared`
        /// before constructing the primitives in place.
        pub struct SharedMutex {
            mutex: core::cell::UnsafeCell<libc::pthread_mutex_t>,
            cond: core::cell::UnsafeCell<libc::pthread_cond_t>,
        }

        // Safety: `pthread_mutex_t`/`pthread_cond_t` configured with the
        // `PTHREAD_PROCESS_SHARED` attribute are designed to be shared
        // across threads and processes; all access here goes through the
        // primitives' own synchronization.
        unsafe impl Send for SharedMutex {}
        unsafe impl Sync for SharedMutex {}

        impl core::fmt::Debug for SharedMutex {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.debug_struct("SharedMutex").finish_non_exhaustive()
            }
        }

        impl Init for SharedMutex {
            // `PTHREAD_MUTEX_INITIALIZER`/`PTHREAD_COND_INITIALIZER` produce a
            // usable, non-shared mutex; [`SharedMutex::init_process_shared`]
            // upgrades it to process-shared on the region's first attacher
            // (spec §5 mode 3: "the Control's mutex/condvar are initialized
            // exactly once by the first attacher").
            const INIT: Self = Self {
                mutex: core::cell::UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
                cond: core::cell::UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
            };
        }

        impl SharedMutex {
            /// Reconstruct the mutex and condvar with the `PTHREAD_PROCESS_SHARED`
            /// attribute so that later attachers mapping the same region at a
            /// different address can still use them.
            ///
            /// # Safety
            /// Must be called exactly once, by the first attacher, before any
            /// other participant calls [`SyncPolicy::lock`] on this instance.
            pub unsafe fn init_process_shared(&self) {
                let mut mutex_attr = core::mem::MaybeUninit::uninit();
                libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr());
                libc::pthread_mutexattr_setpshared(
                    mutex_attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                libc::pthread_mutex_init(self.mutex.get(), mutex_attr.as_ptr());

                let mut cond_attr = core::mem::MaybeUninit::uninit();
                libc::pthread_condattr_init(cond_attr.as_mut_ptr());
                libc::pthread_condattr_setpshared(
                    cond_attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                libc::pthread_cond_init(self.cond.get(), cond_attr.as_ptr());
            }
        }

        unsafe impl SyncPolicy for SharedMutex {
            #[inline]
            fn lock(&self) {
                unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
            }

            #[inline]
            unsafe fn unlock(&self) {
                libc::pthread_mutex_unlock(self.mutex.get());
            }

            const BLOCKING: bool = true;

            #[inline]
            unsafe fn wait(&self) {
                libc::pthread_cond_wait(self.cond.get(), self.mutex.get());
            }

            #[inline]
            unsafe fn notify(&self) {
                libc::pthread_cond_broadcast(self.cond.get());
            }

            #[inline]
            unsafe fn init_shared(&self) {
                self.init_process_shared();
            }
        }
    }
}
