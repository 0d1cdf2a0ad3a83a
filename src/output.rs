use anyhow::Result;

use crate::command::Action;
use crate::probe::VmStatus;

/// This enum encapsulates real time updates about an in-flight operation
/// or status poll.
///
/// For an operation the receiver should expect `OperationStart`, zero or
/// more `Operation` lines in the order the script emitted them, then
/// exactly one `OperationEnd`. For a poll: `ProbeStart` then `ProbeEnd`.
///
/// `OperationEnd(Err(_))` means the script could not be run at all.
/// Receivers should treat it as terminal for the operation.
pub enum Output {
    /// An operation was accepted and its script is about to run
    OperationStart(Action),
    /// One line of combined stdout/stderr from the manager script
    Operation(String),
    /// Operation finished with the provided exit code
    OperationEnd(Result<i32>),

    /// A status poll was accepted
    ProbeStart,
    /// Poll finished with the classified status
    ProbeEnd(VmStatus),
}
