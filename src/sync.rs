#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        hint::spin_loop,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        },
        thread::yield_now,
    };

    /// Cell accessed through closures so that `loom` can track every access.
    pub(crate) struct UnsafeCell<T>(loom::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        pub(crate) fn new(val: T) -> Self {
            Self(loom::cell::UnsafeCell::new(val))
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            self.0.with(f)
        }

        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            self.0.with_mut(f)
        }
    }

    impl<T> core::fmt::Debug for UnsafeCell<T> {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str("UnsafeCell { .. }")
        }
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::{
        hint::spin_loop,
        sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    };
    pub(crate) use std::{sync::Arc, thread::yield_now};

    /// Same surface as `loom::cell::UnsafeCell`, compiled down to plain pointer
    /// access.
    #[repr(transparent)]
    pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        pub(crate) const fn new(val: T) -> Self {
            Self(core::cell::UnsafeCell::new(val))
        }

        #[inline]
        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.0.get())
        }

        #[inline]
        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0.get())
        }
    }

    impl<T> core::fmt::Debug for UnsafeCell<T> {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str("UnsafeCell { .. }")
        }
    }
}

pub(crate) use imp::*;
