//! Per-function call profiler.
//!
//! Every invocation bumps the callee's counter. At half the hot
//! threshold a function becomes WARM, at the threshold HOT, at which
//! point the VM hands it to the native tier: COMPILING during
//! translation, then COMPILED (with the entry pointer published here)
//! or FAILED. All transitions are one-way; FAILED is permanent and
//! leaves the function interpreter-only.

/// Calls before a function is considered hot.
pub const HOT_THRESHOLD: u64 = 100;

/// Signature of a natively compiled function: it receives a pointer to
/// an `i64` mirror of its register window and returns the result.
pub type NativeFn = unsafe extern "C" fn(*mut i64) -> i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FuncState {
    Cold = 0,
    Warm = 1,
    Hot = 2,
    Compiling = 3,
    Compiled = 4,
    Failed = 5,
}

#[derive(Clone, Copy)]
struct Entry {
    calls: u64,
    state: FuncState,
    native: Option<NativeFn>,
}

pub struct Profiler {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Profiler({} functions)", self.entries.len())
    }
}

impl Profiler {
    pub fn new(func_count: usize) -> Self {
        Self {
            entries: vec![
                Entry {
                    calls: 0,
                    state: FuncState::Cold,
                    native: None,
                };
                func_count
            ],
        }
    }

    /// Count one call and apply the COLD -> WARM -> HOT transitions.
    /// Returns the state after the update.
    pub fn record_call(&mut self, func: usize) -> FuncState {
        let entry = &mut self.entries[func];
        entry.calls += 1;
        match entry.state {
            FuncState::Cold if entry.calls >= HOT_THRESHOLD => {
                entry.state = FuncState::Hot;
            }
            FuncState::Cold if entry.calls >= HOT_THRESHOLD / 2 => {
                entry.state = FuncState::Warm;
            }
            FuncState::Warm if entry.calls >= HOT_THRESHOLD => {
                entry.state = FuncState::Hot;
            }
            _ => {}
        }
        entry.state
    }

    pub fn state(&self, func: usize) -> FuncState {
        self.entries[func].state
    }

    pub fn calls(&self, func: usize) -> u64 {
        self.entries[func].calls
    }

    pub fn set_compiling(&mut self, func: usize) {
        self.entries[func].state = FuncState::Compiling;
    }

    pub fn set_compiled(&mut self, func: usize, native: NativeFn) {
        let entry = &mut self.entries[func];
        entry.state = FuncState::Compiled;
        entry.native = Some(native);
    }

    pub fn set_failed(&mut self, func: usize) {
        let entry = &mut self.entries[func];
        entry.state = FuncState::Failed;
        entry.native = None;
    }

    pub fn native(&self, func: usize) -> Option<NativeFn> {
        self.entries[func].native
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_warm_hot_transitions() {
        let mut p = Profiler::new(1);
        for _ in 0..HOT_THRESHOLD / 2 - 1 {
            assert_eq!(p.record_call(0), FuncState::Cold);
        }
        assert_eq!(p.record_call(0), FuncState::Warm);
        for _ in p.calls(0)..HOT_THRESHOLD - 1 {
            assert_eq!(p.record_call(0), FuncState::Warm);
        }
        assert_eq!(p.record_call(0), FuncState::Hot);
        assert_eq!(p.calls(0), HOT_THRESHOLD);
    }

    #[test]
    fn test_failed_is_permanent() {
        let mut p = Profiler::new(1);
        p.set_failed(0);
        for _ in 0..HOT_THRESHOLD * 2 {
            assert_eq!(p.record_call(0), FuncState::Failed);
        }
        assert_eq!(p.native(0), None);
    }

    #[test]
    fn test_state_numbering() {
        assert_eq!(FuncState::Cold as u8, 0);
        assert_eq!(FuncState::Compiled as u8, 4);
        assert_eq!(FuncState::Failed as u8, 5);
    }
}
