use std::borrow::Cow;
use std::error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;
use std::ops::Deref as _;


mod private {
    use super::Error;

    pub trait Sealed {}

    impl<T> Sealed for Option<T> {}
    impl<T, E> Sealed for Result<T, E> {}
    impl Sealed for &'static str {}
    impl Sealed for String {}
    impl Sealed for Error {}
    impl Sealed for std::io::Error {}
}


/// A trait for types that can be converted into a context string.
pub trait IntoCowStr: private::Sealed {
    /// Perform the conversion.
    fn into_cow_str(self) -> Cow<'static, str>;
}

impl IntoCowStr for &'static str {
    fn into_cow_str(self) -> Cow<'static, str> {
        Cow::Borrowed(self)
    }
}

impl IntoCowStr for String {
    fn into_cow_str(self) -> Cow<'static, str> {
        Cow::Owned(self)
    }
}


/// An enum providing a rough classification of errors.
///
/// The first group of variants is what attaching to a process or core
/// file may report. The second group is reported by queries against an
/// attached [`Process`][crate::Process]. The remaining ones classify
/// lower level failures, for example while parsing object files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No process with the given ID exists.
    NoSuchProcess,
    /// The core file to attach to does not exist.
    NoSuchCoreFile,
    /// The target reference names neither a process nor a core file.
    NeitherProcessNorCore,
    /// The executable of the target could not be found.
    ExecutableNotFound,
    /// The target process is a zombie.
    ZombieProcess,
    /// Insufficient permissions to control the target.
    PermissionDenied,
    /// The target is already controlled by another tracer.
    AlreadyControlled,
    /// The target is a system (kernel) process.
    IsSystemProcess,
    /// An attempt was made to control the calling process itself.
    IsSelf,
    /// The operation was interrupted.
    Interrupted,
    /// The target is a 64 bit process but the controller is 32 bit.
    WordSizeMismatch,
    /// The file is not in core file format.
    NotCoreFormat,
    /// The object file reader reported an error.
    UnderlyingFormatLibraryError,
    /// The core file lacks the required note segment.
    MissingNoteSegment,
    /// The core file was produced on a different architecture.
    WrongArchitecture,
    /// A light weight process specification was malformed.
    InvalidLwpSpecification,
    /// The system ran out of file descriptors.
    OutOfFileDescriptors,
    /// An otherwise unclassified system error.
    ///
    /// The system error code is available through
    /// [`Error::raw_os_error`].
    Unspecified,
    /// The requested entity was not found.
    NotFound,
    /// The handle was already released.
    InvalidHandle,
    /// The target executed a new image without the cached state having
    /// been reset.
    StaleState,
    /// A parameter was incorrect.
    InvalidInput,
    /// Data not valid for the operation was encountered.
    InvalidData,
    /// The operation is not supported.
    Unsupported,
    /// Data ended prematurely.
    UnexpectedEof,
    /// A custom error that does not fall under any other category.
    Other,
}

impl ErrorKind {
    /// Retrieve a textual representation of the error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSuchProcess => "no such process",
            Self::NoSuchCoreFile => "no such core file",
            Self::NeitherProcessNorCore => "argument is neither a process nor a core file",
            Self::ExecutableNotFound => "executable file not found",
            Self::ZombieProcess => "process is a zombie",
            Self::PermissionDenied => "permission denied",
            Self::AlreadyControlled => "process is traced",
            Self::IsSystemProcess => "system process",
            Self::IsSelf => "attempt to grab self",
            Self::Interrupted => "operation interrupted",
            Self::WordSizeMismatch => "process is 64 bit while controller is 32 bit",
            Self::NotCoreFormat => "file is not a core file",
            Self::UnderlyingFormatLibraryError => "object file format error",
            Self::MissingNoteSegment => "core file is missing its note segment",
            Self::WrongArchitecture => "core file is for a different architecture",
            Self::InvalidLwpSpecification => "invalid lwp specification",
            Self::OutOfFileDescriptors => "out of file descriptors",
            Self::Unspecified => "unanticipated system error",
            Self::NotFound => "entity not found",
            Self::InvalidHandle => "handle was released",
            Self::StaleState => "cached state is stale",
            Self::InvalidInput => "invalid input parameter",
            Self::InvalidData => "invalid data",
            Self::Unsupported => "unsupported",
            Self::UnexpectedEof => "unexpected end of file",
            Self::Other => "other error",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(other: io::ErrorKind) -> Self {
        match other {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::Interrupted => Self::Interrupted,
            io::ErrorKind::InvalidInput => Self::InvalidInput,
            io::ErrorKind::InvalidData => Self::InvalidData,
            io::ErrorKind::Unsupported => Self::Unsupported,
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            _ => Self::Other,
        }
    }
}


enum ErrorImpl {
    Io {
        kind: ErrorKind,
        error: io::Error,
    },
    Message {
        kind: ErrorKind,
        message: Box<str>,
    },
    Context {
        context: Cow<'static, str>,
        source: Box<ErrorImpl>,
    },
}

impl ErrorImpl {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { kind, .. } | Self::Message { kind, .. } => *kind,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Retrieve the error layer below this one, if any.
    fn layer(&self) -> Option<&ErrorImpl> {
        match self {
            Self::Io { .. } | Self::Message { .. } => None,
            Self::Context { source, .. } => Some(source),
        }
    }

    fn innermost(&self) -> &ErrorImpl {
        let mut error = self;
        while let Some(next) = error.layer() {
            error = next;
        }
        error
    }

    fn fmt_self(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Io { error, .. } => Display::fmt(error, f),
            Self::Message { message, .. } => f.write_str(message),
            Self::Context { context, .. } => f.write_str(context),
        }
    }
}

impl Display for ErrorImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let () = self.fmt_self(f)?;

        if f.alternate() {
            let mut layer = self.layer();
            while let Some(error) = layer {
                let () = f.write_str(": ")?;
                let () = error.fmt_self(f)?;
                layer = error.layer();
            }
        }
        Ok(())
    }
}


/// The error type used by the library.
///
/// Errors generally form a chain, with higher-level errors typically
/// providing additional context for lower level ones. The `Display`
/// representation only shows the outermost layer, the alternate one
/// (`{:#}`) the entire chain.
pub struct Error {
    error: Box<ErrorImpl>,
}

impl Error {
    #[inline]
    pub(crate) fn with_kind<M>(kind: ErrorKind, message: M) -> Self
    where
        M: ToString,
    {
        Self {
            error: Box::new(ErrorImpl::Message {
                kind,
                message: message.to_string().into_boxed_str(),
            }),
        }
    }

    /// Create an error of the given `kind` wrapping a system error.
    #[inline]
    pub(crate) fn with_os_error(kind: ErrorKind, error: io::Error) -> Self {
        Self {
            error: Box::new(ErrorImpl::Io { kind, error }),
        }
    }

    #[inline]
    pub(crate) fn with_not_found<M>(message: M) -> Self
    where
        M: ToString,
    {
        Self::with_kind(ErrorKind::NotFound, message)
    }

    #[inline]
    pub(crate) fn with_invalid_data<M>(message: M) -> Self
    where
        M: ToString,
    {
        Self::with_kind(ErrorKind::InvalidData, message)
    }

    #[inline]
    pub(crate) fn with_unsupported<M>(message: M) -> Self
    where
        M: ToString,
    {
        Self::with_kind(ErrorKind::Unsupported, message)
    }

    /// Retrieve a rough error classification in the form of an
    /// [`ErrorKind`].
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Retrieve the system error code underlying this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self.error.innermost() {
            ErrorImpl::Io { error, .. } => error.raw_os_error(),
            _ => None,
        }
    }

    fn layer_context(self, context: Cow<'static, str>) -> Self {
        Self {
            error: Box::new(ErrorImpl::Context {
                context,
                source: self.error,
            }),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if f.alternate() {
            return f
                .debug_struct("Error")
                .field("kind", &self.kind())
                .field("message", &format_args!("{:#}", self.error))
                .finish()
        }

        let () = self.error.fmt_self(f)?;
        if let Some(mut layer) = self.error.layer() {
            let () = f.write_str("\n\nCaused by:")?;
            loop {
                let () = f.write_str("\n    ")?;
                let () = layer.fmt_self(f)?;
                match layer.layer() {
                    Some(next) => layer = next,
                    None => break,
                }
            }
        }
        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(self.error.deref(), f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.error.innermost() {
            ErrorImpl::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Self {
        let kind = ErrorKind::from(other.kind());
        Self::with_os_error(kind, other)
    }
}


/// A trait providing ergonomic chaining capabilities to [`Error`].
pub trait ErrorExt: private::Sealed {
    /// The output type produced by [`context`](Self::context) and
    /// [`with_context`](Self::with_context).
    type Output;

    /// Add context to this error.
    // If we had specialization of sorts we could be more lenient as to
    // what we can accept, but for now this method always works with
    // static strings and nothing else.
    fn context<C>(self, context: C) -> Self::Output
    where
        C: IntoCowStr;

    /// Add context to this error, using a closure for lazy evaluation.
    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: IntoCowStr,
        F: FnOnce() -> C;
}

impl ErrorExt for Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: IntoCowStr,
    {
        self.layer_context(context.into_cow_str())
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        self.layer_context(f().into_cow_str())
    }
}

impl ErrorExt for io::Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: IntoCowStr,
    {
        Error::from(self).context(context)
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        Error::from(self).with_context(f)
    }
}

impl<T, E> ErrorExt for Result<T, E>
where
    E: ErrorExt,
{
    type Output = Result<T, E::Output>;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: IntoCowStr,
    {
        match self {
            Ok(val) => Ok(val),
            Err(err) => Err(err.context(context)),
        }
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        match self {
            Ok(val) => Ok(val),
            Err(err) => Err(err.with_context(f)),
        }
    }
}


/// A trait providing conversion shortcuts for creating [`Error`]
/// instances from `Option`s.
pub trait IntoError<T>: private::Sealed
where
    Self: Sized,
{
    /// Convert into a `Result`, creating an error of the given kind with
    /// the message produced by `f` if no value is present.
    fn ok_or_error<M, F>(self, kind: ErrorKind, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M;

    /// Shortcut for [`ok_or_error`](Self::ok_or_error) using
    /// [`ErrorKind::InvalidData`].
    #[inline]
    fn ok_or_invalid_data<M, F>(self, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M,
    {
        self.ok_or_error(ErrorKind::InvalidData, f)
    }

    /// Shortcut for [`ok_or_error`](Self::ok_or_error) using
    /// [`ErrorKind::InvalidInput`].
    #[inline]
    fn ok_or_invalid_input<M, F>(self, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M,
    {
        self.ok_or_error(ErrorKind::InvalidInput, f)
    }

    /// Shortcut for [`ok_or_error`](Self::ok_or_error) using
    /// [`ErrorKind::NotFound`].
    #[inline]
    fn ok_or_not_found<M, F>(self, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M,
    {
        self.ok_or_error(ErrorKind::NotFound, f)
    }

    /// Shortcut for [`ok_or_error`](Self::ok_or_error) using
    /// [`ErrorKind::UnexpectedEof`].
    #[inline]
    fn ok_or_unexpected_eof<M, F>(self, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M,
    {
        self.ok_or_error(ErrorKind::UnexpectedEof, f)
    }
}

impl<T> IntoError<T> for Option<T> {
    #[inline]
    fn ok_or_error<M, F>(self, kind: ErrorKind, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M,
    {
        self.ok_or_else(|| Error::with_kind(kind, f()))
    }
}
