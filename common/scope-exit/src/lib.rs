//! Ad-hoc scope guards.
//!
//! The [`scope_exit!`] macro covers the common case of undoing something
//! when a scope ends. [`ScopeExit`] can be used directly when the cleanup
//! must be cancelled again, for example after a step has been committed.

#![warn(missing_docs)]

use std::mem::ManuallyDrop;

/// Runs a closure when dropped, unless dismissed.
#[must_use = "the closure runs immediately if the guard is not bound"]
pub struct ScopeExit<F>
    where F: FnOnce()
{
    f: ManuallyDrop<F>,
    armed: bool,
}

impl<F> ScopeExit<F>
    where F: FnOnce()
{
    /// Create a guard that runs `f` at the end of the scope.
    pub fn new(f: F) -> Self
    {
        Self{f: ManuallyDrop::new(f), armed: true}
    }

    /// Drop the guard without running the closure.
    pub fn dismiss(mut self)
    {
        self.armed = false;
        // SAFETY: self.f will not be used anymore; Drop sees armed == false.
        unsafe { ManuallyDrop::drop(&mut self.f); }
    }
}

impl<F> Drop for ScopeExit<F>
    where F: FnOnce()
{
    fn drop(&mut self)
    {
        if !self.armed {
            return;
        }
        // SAFETY: self.f will not be used anymore.
        let f = unsafe { ManuallyDrop::take(&mut self.f) };
        f();
    }
}

/// Define an ad-hoc scope guard.
///
/// The code passed to this macro is performed at the end of the scope.
/// It is performed when the scope ends or when a panic passes through.
///
/// # Examples
///
/// ```
/// # use scope_exit::scope_exit;
/// use std::cell::Cell;
/// let x = Cell::new(0);
/// {
///     scope_exit! { x.set(1); }
///     x.set(2);
/// }
/// assert_eq!(x.get(), 1);
/// ```
#[macro_export]
macro_rules! scope_exit
{
    { $($tt:tt)* } => {
        let __scope_exit = $crate::ScopeExit::new(|| { $($tt)* });
    };
}

#[cfg(test)]
mod tests
{
    use {super::*, std::cell::Cell};

    #[test]
    fn dismissed_guard_does_not_run()
    {
        let ran = Cell::new(false);
        let guard = ScopeExit::new(|| ran.set(true));
        guard.dismiss();
        assert!(!ran.get());
    }

    #[test]
    fn guard_runs_during_unwind()
    {
        let ran = Cell::new(false);
        let result = std::panic::catch_unwind(
            std::panic::AssertUnwindSafe(|| {
                scope_exit! { ran.set(true); }
                panic!("unwinding");
            }),
        );
        assert!(result.is_err());
        assert!(ran.get());
    }
}
