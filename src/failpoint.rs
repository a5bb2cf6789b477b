//! Named failpoints for injecting I/O errors in tests.
//!
//! Each thread carries its own set of armed points, seeded on first use
//! from the `GRANITE_FAILPOINTS` environment variable (comma-separated
//! names) and mutated with [`enable`] / [`disable`] or, scoped to a region,
//! with [`scoped`]. Code under test asks [`maybe_fail`] at the spots where
//! an I/O error should be injectable.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

thread_local! {
    static ARMED: RefCell<HashSet<String>> = RefCell::new(armed_from_env());
}

fn armed_from_env() -> HashSet<String> {
    let Ok(raw) = std::env::var("GRANITE_FAILPOINTS") else {
        return HashSet::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// Arms `name` on the current thread.
pub fn enable(name: &str) {
    ARMED.with_borrow_mut(|armed| {
        armed.insert(name.to_string());
    });
}

/// Disarms `name` on the current thread.
pub fn disable(name: &str) {
    ARMED.with_borrow_mut(|armed| {
        armed.remove(name);
    });
}

/// Disarms everything on the current thread, the environment seed included.
pub fn clear() {
    ARMED.with_borrow_mut(HashSet::clear);
}

pub fn is_enabled(name: &str) -> bool {
    ARMED.with_borrow(|armed| armed.contains(name))
}

pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        return Err(io::Error::other(format!("failpoint {name} hit")));
    }
    Ok(())
}

/// Arms `name` on this thread until the returned guard is dropped.
pub fn scoped(name: &str) -> FailpointGuard {
    enable(name);
    FailpointGuard {
        name: name.to_string(),
    }
}

pub struct FailpointGuard {
    name: String,
}

impl Drop for FailpointGuard {
    fn drop(&mut self) {
        disable(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arming_is_per_name() {
        enable("a::b");
        assert!(is_enabled("a::b"));
        assert!(!is_enabled("a::c"));
        assert!(maybe_fail("a::b").is_err());
        assert!(maybe_fail("a::c").is_ok());
        disable("a::b");
        assert!(maybe_fail("a::b").is_ok());
    }

    #[test]
    fn scoped_failpoint_disarms_on_drop() {
        {
            let _fp = scoped("test::point");
            assert!(maybe_fail("test::point").is_err());
        }
        assert!(maybe_fail("test::point").is_ok());
    }

    #[test]
    fn clear_disarms_everything() {
        enable("x::1");
        enable("x::2");
        clear();
        assert!(!is_enabled("x::1"));
        assert!(!is_enabled("x::2"));
    }
}
