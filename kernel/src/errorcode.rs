// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Standard error enum for control-plane operations.

use core::convert::TryFrom;

/// Standard errors returned by Link Layer control operations.
///
/// Real-time paths (prepare callbacks, radio ISR continuations, aborts)
/// never return an `ErrorCode`. They report through outcome records. The
/// enum is only used where a caller in thread context can act on the
/// failure, e.g. enabling a role or queueing a PDU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorCode {
    /// Generic failure condition
    FAIL = 0,
    /// Underlying system is busy; retry
    BUSY = 1,
    /// The state requested is already set
    ALREADY = 2,
    /// The role is not enabled
    OFF = 3,
    /// Reservation required before use
    RESERVE = 4,
    /// An invalid parameter was passed
    INVAL = 5,
    /// Parameter passed was too large
    SIZE = 6,
    /// Operation canceled by a call
    CANCEL = 7,
    /// Memory required not available
    NOMEM = 8,
    /// Operation or command is unsupported
    NOSUPPORT = 9,
    /// Role slot or stream does not exist
    NODEVICE = 10,
}

impl From<ErrorCode> for usize {
    fn from(err: ErrorCode) -> usize {
        err as usize
    }
}

impl TryFrom<usize> for ErrorCode {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::FAIL),
            1 => Ok(ErrorCode::BUSY),
            2 => Ok(ErrorCode::ALREADY),
            3 => Ok(ErrorCode::OFF),
            4 => Ok(ErrorCode::RESERVE),
            5 => Ok(ErrorCode::INVAL),
            6 => Ok(ErrorCode::SIZE),
            7 => Ok(ErrorCode::CANCEL),
            8 => Ok(ErrorCode::NOMEM),
            9 => Ok(ErrorCode::NOSUPPORT),
            10 => Ok(ErrorCode::NODEVICE),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::ErrorCode;
    use core::convert::TryFrom;

    #[test]
    fn usize_conversion_is_reversible() {
        for code in [
            ErrorCode::FAIL,
            ErrorCode::BUSY,
            ErrorCode::INVAL,
            ErrorCode::NOMEM,
            ErrorCode::NODEVICE,
        ] {
            assert_eq!(ErrorCode::try_from(usize::from(code)), Ok(code));
        }
        assert_eq!(ErrorCode::try_from(11), Err(()));
    }
}
