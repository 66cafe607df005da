// Copyright (c) 2026 Openmesh Network
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Persistent key-value block store using sled.
//!
//! The BFT application stages all writes of one block into a [`sled::Batch`]
//! during `finalize_block` and applies it here on `commit`. An applied batch
//! is flushed so committed transactions are on disk before the engine moves on.

use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("db open")]
    DbOpen,
    #[error("db io")]
    DbIo,
}

/// Persistent block store wrapper.
#[derive(Clone)]
pub struct BlockStore {
    db: sled::Db,
}

impl BlockStore {
    /// Open the sled DB at `path` (a directory).
    pub fn open(path: &str) -> Result<Self, StateError> {
        let db = sled::open(path).map_err(|_| StateError::DbOpen)?;
        Ok(Self { db })
    }

    /// Get a value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let v = self.db.get(key).map_err(|_| StateError::DbIo)?;
        Ok(v.map(|iv| iv.to_vec()))
    }

    /// Apply a staged block batch atomically and flush it to disk.
    pub fn commit_block(&self, batch: sled::Batch) -> Result<(), StateError> {
        self.db.apply_batch(batch).map_err(|_| StateError::DbIo)?;
        self.db.flush().map_err(|_| StateError::DbIo)?;
        Ok(())
    }
}
