use std::io;

use thiserror::Error;

use crate::kernel::KernError;

pub type DbgResult<T> = std::result::Result<T, DbgError>;

/// Outcome of a successfully executed debugger command. Failures travel as
/// `DbgError`; the REPL maps them to its failure status and prints the error
/// line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CmdStatus {
    Success,
    /// Returned only by `quit`; propagates to process exit 0.
    Quit,
}

#[derive(Debug, Error)]
pub enum DbgError {
    #[error("not attached to anything")]
    NotAttached,

    #[error("debuggee must be suspended")]
    NotSuspended,

    #[error("tracing is not supported on this host")]
    TracingUnsupported,

    #[error("already tracing")]
    AlreadyTracing,

    #[error(
        "couldn't get task port for {target} (pid: {pid}): {err}\n\
         Did you forget to sign machdbg with entitlements?\n\
         Are you privileged enough to debug this process?"
    )]
    TaskPortDenied {
        target: String,
        pid: libc::pid_t,
        err: KernError,
    },

    #[error("{op} failed: {err}")]
    Kernel { op: &'static str, err: KernError },

    #[error("could not find a free hardware {0} register")]
    NoFreeSlot(&'static str),

    #[error("breakpoint {0} does not exist")]
    NoSuchBreakpoint(u32),

    #[error("watchpoint {0} does not exist")]
    NoSuchWatchpoint(u32),

    #[error("invalid watchpoint size {0}")]
    BadWatchSize(u32),

    #[error("unknown register {0}")]
    UnknownRegister(String),

    #[error("malformed value {0}")]
    MalformedLiteral(String),

    #[error("{value} does not fit in {width} bits")]
    WidthOverflow { value: String, width: u32 },

    #[error("unknown signal {0}")]
    UnknownSignal(i32),

    #[error("unable to resolve a PID for {0}")]
    NoSuchProcess(String),

    #[error("could not detach from the debuggee: {0}")]
    DetachFailed(String),

    #[error("missing argument {0}")]
    MissingArgument(&'static str),

    #[error("{0}")]
    Collaborator(String),

    #[error("{0}")]
    Io(#[from] io::Error),

    /// Internal invariant violations abort the command, never the process.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}
