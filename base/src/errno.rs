// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Display;
use std::io;
use std::result;

/// A host error number, as left in errno by a failed system call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error(i32);
pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new(errno: i32) -> Error {
        Error(errno)
    }

    /// The error of the last failed call on this thread.
    pub fn last() -> Error {
        Error(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    }

    pub fn errno(self) -> i32 {
        self.0
    }
}

// Errors without an OS code, such as a failed thread spawn, become EINVAL.
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error(e.raw_os_error().unwrap_or(libc::EINVAL))
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (errno {})", io::Error::from_raw_os_error(self.0), self.0)
    }
}
