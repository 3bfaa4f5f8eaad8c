use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::num::NonZeroU32;
use std::process;


/// An enumeration identifying a process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pid {
    /// The current process.
    Slf,
    /// The process identified by the provided ID.
    Pid(NonZeroU32),
}

impl Pid {
    /// Create a [`Pid`] from a raw process ID.
    ///
    /// Process ID 0 does not refer to a process that can be controlled
    /// and `None` is returned for it.
    #[inline]
    pub fn new(pid: u32) -> Option<Self> {
        NonZeroU32::new(pid).map(Pid::Pid)
    }

    /// Resolve this [`Pid`] into an actual number, if it is the symbolic
    /// [`Pid::Slf`] variant.
    pub fn resolve(&self) -> u32 {
        match self {
            Self::Slf => process::id(),
            Self::Pid(pid) => pid.get(),
        }
    }

    /// Check whether this [`Pid`] refers to the calling process.
    pub(crate) fn is_self(&self) -> bool {
        self.resolve() == process::id()
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Slf => write!(f, "self"),
            Self::Pid(pid) => write!(f, "{pid}"),
        }
    }
}

impl From<NonZeroU32> for Pid {
    fn from(pid: NonZeroU32) -> Self {
        Pid::Pid(pid)
    }
}
