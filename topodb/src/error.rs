// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bad key {0}")]
    BadKey(String),

    #[error("bad record {0}")]
    BadRecord(String),
}
