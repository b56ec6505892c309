// Copyright 2025 OPPO.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Errors surfaced by master file system operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("Requested replication {requested} for {src} is outside the allowed range [{min}, {max}]")]
    Replication {
        src: String,
        requested: u16,
        min: u16,
        max: u16,
    },

    #[error("block {0} not found")]
    BlockNotFound(i64),

    #[error("datanode {0} is not registered")]
    NodeNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conf error: {0}")]
    Conf(String),

    #[error("{0}")]
    Common(String),
}

impl FsError {
    pub fn common(msg: impl Into<String>) -> Self {
        FsError::Common(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        FsError::InvalidState(msg.into())
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Build an `Err(FsError::Common)` from format arguments.
#[macro_export]
macro_rules! err_box {
    ($($arg:tt)*) => {
        Err($crate::error::FsError::Common(format!($($arg)*)))
    };
}
