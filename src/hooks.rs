use std::fmt::Debug;

use crate::log::debug;


/// Customization points invoked by a [`Process`][crate::Process].
///
/// All methods have default implementations, so implementors only need
/// to override what they are interested in.
pub trait Hooks: Debug + Send + Sync {
    /// Report a diagnostic message.
    ///
    /// Messages are only reported if debug reporting is enabled in the
    /// [`Config`][crate::Config]. The hook has no influence on the
    /// operation reporting the message.
    fn report(&self, message: &str) {
        debug!("{message}")
    }

    /// Invoked in the child process of
    /// [`Process::create`][crate::Process::create] after it got forked
    /// and before it executes the new program.
    ///
    /// Only async-signal-safe functionality may be used here, as the
    /// child is the copy of a potentially multi-threaded program.
    fn post_fork_pre_exec(&self) {}
}


/// The [`Hooks`] used when no others are provided.
///
/// Messages are forwarded to the crate's logging.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}
