use crate::ScriptType;

/// Errors raised back into the script VM.
///
/// Native methods return these instead of unwinding; the VM turns them into a
/// script-level error that aborts the current script call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("arg {index} expect {expected}, but got {got}")]
    BadArgument {
        index: i32,
        expected: &'static str,
        got: &'static str,
    },
    #[error("{container} {operation} index {index} out of range")]
    IndexOutOfRange {
        container: &'static str,
        operation: &'static str,
        index: i64,
    },
    #[error("Map key[{0}] not found!")]
    KeyNotFound(String),
    #[error("only struct property support but got {0}")]
    NotAggregate(String),
    #[error("{field} of {owner}'s member not found.")]
    FieldNotFound { field: String, owner: String },
    #[error(
        "{0} arrays do not support LessGC enumeration! Only struct type arrays are supported!"
    )]
    LessGcUnsupported(String),
    #[error("Unsupported type[{tag}] of {container}!")]
    UnsupportedType { tag: i64, container: &'static str },
    #[error("expect {expected}, but got {got}")]
    TypeMismatch { expected: String, got: &'static str },
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),
    #[error("{0} has already been released")]
    Released(&'static str),
    #[error("{0} is already in use")]
    Reentrant(&'static str),
    #[error("{0}")]
    Runtime(String),
}

impl ScriptError {
    pub fn bad_argument(index: i32, expected: &'static str, got: ScriptType) -> Self {
        Self::BadArgument {
            index,
            expected,
            got: got.name(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, got: ScriptType) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            got: got.name(),
        }
    }
}
