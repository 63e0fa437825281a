/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{fmt::Display, io::ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub struct AtzError {
    /// standard error code
    exit_code: ExitCode,

    /// diagnostic message including location. Content should not be relied on.
    message: String,
}

pub type Result<T> = std::result::Result<T, AtzError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExitCode {
    /// the container magic, stored length or descriptor layout is inconsistent
    InvalidAtzContainer = 1,

    /// the reconstructed file does not match the original
    RoundtripMismatch = 2,

    /// inflateInit/deflateInit refused the requested parameters
    ZlibInitFailed = 3,

    /// a stream that previously validated no longer decompresses cleanly,
    /// or zlib returned a code it never should on this path
    ZlibInvariant = 4,

    /// a parameter triple outside the ranges zlib accepts
    InvalidParameters = 5,

    ShortRead = 16,
    OsError = 17,
    GeneralFailure = 18,
}

impl ExitCode {
    /// builds an error with this exit code and the given message
    pub fn error(self, message: impl AsRef<str>) -> AtzError {
        AtzError {
            exit_code: self,
            message: message.as_ref().to_owned(),
        }
    }
}

/// shorthand used all over the library for bailing out with a given code
pub fn err_exit_code<T>(exit_code: ExitCode, message: impl AsRef<str>) -> Result<T> {
    Err(exit_code.error(message))
}

impl AtzError {
    pub fn new(exit_code: ExitCode, message: &str) -> AtzError {
        AtzError {
            exit_code,
            message: message.to_owned(),
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        self.exit_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Display for AtzError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{0}: {1}", self.exit_code, self.message)
    }
}

impl std::error::Error for AtzError {}

/// translates std::io::Error into AtzError, recovering any AtzError that was
/// previously stashed inside when we crossed a Read/Write API boundary
impl From<std::io::Error> for AtzError {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        match e.downcast::<AtzError>() {
            Ok(le) => le,
            Err(e) => {
                let caller = std::panic::Location::caller();
                AtzError {
                    exit_code: get_io_error_exit_code(&e),
                    message: format!("error {} at {}", e, caller),
                }
            }
        }
    }
}

fn get_io_error_exit_code(e: &std::io::Error) -> ExitCode {
    if e.kind() == ErrorKind::UnexpectedEof {
        ExitCode::ShortRead
    } else {
        ExitCode::OsError
    }
}

/// translates AtzError into std::io::Error, which involves putting into a Box and using Other
impl From<AtzError> for std::io::Error {
    fn from(e: AtzError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, e)
    }
}

/// appends the caller location to the error message as it propagates upwards
pub trait AddContext<T> {
    fn context(self) -> Result<T>;
}

impl<T, E: Into<AtzError>> AddContext<T> for std::result::Result<T, E> {
    #[track_caller]
    fn context(self) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => {
                let mut e = e.into();
                let caller = std::panic::Location::caller();
                e.message = format!("{} (at {})", e.message, caller);
                Err(e)
            }
        }
    }
}

#[test]
fn test_error_translation() {
    // test wrapping inside an io error
    fn my_std_error() -> std::result::Result<(), std::io::Error> {
        Err(AtzError::new(ExitCode::InvalidAtzContainer, "test error").into())
    }

    let e: AtzError = my_std_error().unwrap_err().into();
    assert_eq!(e.exit_code, ExitCode::InvalidAtzContainer);
    assert_eq!(e.message, "test error");

    // an IO error should be translated into an OsError
    let e: AtzError =
        std::io::Error::new(std::io::ErrorKind::NotFound, "file not found").into();
    assert_eq!(e.exit_code, ExitCode::OsError);

    // a short read should keep its own code
    let e: AtzError =
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
    assert_eq!(e.exit_code, ExitCode::ShortRead);
}

#[test]
fn test_add_context() {
    let r: Result<()> = err_exit_code(ExitCode::GeneralFailure, "base").context();
    let e = r.unwrap_err();
    assert_eq!(e.exit_code(), ExitCode::GeneralFailure);
    assert!(e.message().starts_with("base (at "));
}
