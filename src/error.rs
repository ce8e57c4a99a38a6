use crate::object::{ClassId, ClassKind};
use thiserror::Error;

/// Conditions reported back to the embedder. Heap integrity violations are not errors: they
/// go through [`fatal!`](crate::fatal) and never return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("class id {0} is not registered")]
    InvalidClass(ClassId),
    #[error("invalid allocation size {0}")]
    InvalidSize(usize),
    #[error("classes of kind {0:?} cannot be registered by the embedder")]
    UnsupportedClassKind(ClassKind),
    #[error("class table is full")]
    ClassTableFull,
    #[error("failed to reserve {0} bytes of virtual memory")]
    ReservationFailed(usize),
}

/// Promotion into old space failed under the current growth policy. Handled inside the
/// scavenger by switching to forced growth and, failing that, copying within new space.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("failed to promote {size} bytes")]
pub(crate) struct PromotionFailure {
    pub size: usize,
}

/// Logs `message` with a backtrace and panics.
#[cold]
#[inline(never)]
pub fn fatal_error(message: std::fmt::Arguments<'_>) -> ! {
    let message = message.to_string();
    log::error!("[gc] fatal: {}", message);
    let backtrace = backtrace::Backtrace::new();
    log::error!("[gc] backtrace:\n{:?}", backtrace);
    panic!("heap integrity violation: {}", message);
}

/// Aborts on a heap integrity violation.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal_error(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = HeapError::OutOfMemory { requested: 64 };
        assert_eq!(err.to_string(), "out of memory while allocating 64 bytes");
        assert_eq!(
            PromotionFailure { size: 32 }.to_string(),
            "failed to promote 32 bytes"
        );
    }

    #[test]
    #[should_panic(expected = "heap integrity violation: bad slot 3")]
    fn fatal_panics_with_message() {
        crate::fatal!("bad slot {}", 3);
    }
}
