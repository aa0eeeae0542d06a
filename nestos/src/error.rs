//! Error types.

/// A list specifying categories of page table operation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The address lies below the user boundary.
    NotUserPage,
    /// No frame or kernel page is left.
    NoMemory,
    /// Duplicated mapping.
    AlreadyMapped,
    /// The page is not mapped, or may not be brought in.
    NotMapped,
    /// A write hit a read-only page.
    ReadOnly,
    /// Unaligned address.
    Unaligned,
}

/// A list specifying categories of kernel operation error.
///
/// System calls report these to user space as the negative number returned
/// by [`KernelError::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Out of frames, kernel pages or heap.
    NoMemory,
    /// An argument is out of range or the caller is in the wrong state.
    InvalidArgument,
    /// A user pointer does not name accessible memory.
    BadAddress,
    /// No thread has the given id, or it is not in the state asked for.
    NoSuchThread,
    /// The caller has no child process.
    NoChildren,
    /// Blocking could never be satisfied.
    WouldBlockForever,
    /// The image table has no executable by that name.
    ImageNotFound,
    /// The executable is malformed.
    BadImage,
}

impl KernelError {
    /// The status this error is reported with.
    pub const fn status(self) -> i32 {
        match self {
            Self::NoMemory => -1,
            Self::InvalidArgument => -2,
            Self::BadAddress => -3,
            Self::NoSuchThread => -4,
            Self::NoChildren => -5,
            Self::WouldBlockForever => -6,
            Self::ImageNotFound => -7,
            Self::BadImage => -8,
        }
    }
}

impl From<MappingError> for KernelError {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::NoMemory => Self::NoMemory,
            MappingError::Unaligned => Self::InvalidArgument,
            _ => Self::BadAddress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_distinct_and_negative() {
        let all = [
            KernelError::NoMemory,
            KernelError::InvalidArgument,
            KernelError::BadAddress,
            KernelError::NoSuchThread,
            KernelError::NoChildren,
            KernelError::WouldBlockForever,
            KernelError::ImageNotFound,
            KernelError::BadImage,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.status() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.status(), b.status());
            }
        }
    }

    #[test]
    fn mapping_errors_convert() {
        assert_eq!(
            KernelError::from(MappingError::NoMemory),
            KernelError::NoMemory
        );
        assert_eq!(
            KernelError::from(MappingError::ReadOnly),
            KernelError::BadAddress
        );
    }
}
