//! Process-wide configuration.
//!
//! A [`Config`] can be installed once, before it is first used by any
//! attach operation. Afterwards it is frozen for the lifetime of the
//! program. If none is installed, the configuration is derived from the
//! environment.

use std::env::var_os;
use std::sync::OnceLock;

use crate::Error;
use crate::ErrorKind;
use crate::Result;


/// Enables diagnostics being passed to [`Hooks::report`][crate::Hooks::report].
const ENV_DEBUG: &str = "PROCCTL_DEBUG";
/// Disables the sorting of symbols by address.
const ENV_NO_SORT: &str = "PROCCTL_NO_SORT";
/// Makes symbol tables be read from target memory only.
const ENV_INCORE_ELF: &str = "PROCCTL_INCORE_ELF";


static CONFIG: OnceLock<Config> = OnceLock::new();


/// A builder for [`Config`] objects.
///
/// Defaults are taken from the environment: the presence of
/// `PROCCTL_DEBUG`, `PROCCTL_NO_SORT`, and `PROCCTL_INCORE_ELF` enables
/// debug reporting, disables address sorting, and enables in-core
/// symbol tables, respectively.
#[derive(Clone, Debug)]
pub struct Builder {
    /// See [`Builder::enable_debug`].
    debug: bool,
    /// See [`Builder::enable_sort`].
    sort: bool,
    /// See [`Builder::enable_in_core_elf`].
    in_core_elf: bool,
}

impl Builder {
    /// Enable/disable the passing of diagnostic messages to the
    /// [`Hooks::report`][crate::Hooks::report] hook.
    pub fn enable_debug(mut self, enable: bool) -> Builder {
        self.debug = enable;
        self
    }

    /// Enable/disable sorting of symbol tables by address.
    ///
    /// Disabling sorting only affects the order in which symbols are
    /// visited by address. Lookups work regardless, but address lookups
    /// are slower.
    pub fn enable_sort(mut self, enable: bool) -> Builder {
        self.sort = enable;
        self
    }

    /// Enable/disable the reading of object information and symbol
    /// tables from target memory instead of object files.
    ///
    /// Only dynamic symbol tables are present in memory.
    pub fn enable_in_core_elf(mut self, enable: bool) -> Builder {
        self.in_core_elf = enable;
        self
    }

    /// Create the [`Config`] object.
    pub fn build(self) -> Config {
        let Builder {
            debug,
            sort,
            in_core_elf,
        } = self;

        Config {
            debug,
            sort,
            in_core_elf,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            debug: var_os(ENV_DEBUG).is_some(),
            sort: var_os(ENV_NO_SORT).is_none(),
            in_core_elf: var_os(ENV_INCORE_ELF).is_some(),
        }
    }
}


/// The process-wide configuration of the library.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    debug: bool,
    sort: bool,
    in_core_elf: bool,
}

impl Config {
    /// Retrieve a [`Builder`] object for configurable construction of a
    /// [`Config`].
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Install this configuration for the remainder of the program.
    ///
    /// This fails if a configuration has been installed or used before.
    pub fn install(self) -> Result<()> {
        CONFIG.set(self).map_err(|_config| {
            Error::with_kind(
                ErrorKind::InvalidInput,
                "configuration is frozen; it has been installed or used before",
            )
        })
    }

    /// Retrieve the configuration in effect, freezing it.
    pub fn current() -> &'static Config {
        CONFIG.get_or_init(|| Builder::default().build())
    }

    /// Whether diagnostic messages are reported.
    #[inline]
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Whether symbol tables are sorted by address.
    #[inline]
    pub fn sort(&self) -> bool {
        self.sort
    }

    /// Whether object data is read from target memory only.
    #[inline]
    pub fn in_core_elf(&self) -> bool {
        self.in_core_elf
    }
}

impl Default for Config {
    fn default() -> Self {
        Builder::default().build()
    }
}
