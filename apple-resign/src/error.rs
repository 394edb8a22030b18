// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        embedded_signature::{CodeSigningMagic, DigestType},
        special_slots::SpecialSlot,
    },
    std::{path::PathBuf, time::Duration},
    thiserror::Error,
};

/// Unified error type for re-signing operations.
///
/// Every variant aborts the resign operation that produced it. Conditions
/// that only degrade the result (such as a designated requirement that
/// doesn't have the expected shape) are logged instead of being raised.
#[derive(Debug, Error)]
pub enum ResignError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("malformed signature data: {0}")]
    MalformedStructure(&'static str),

    #[error("required blob {0:?} not present in signature data")]
    BlobNotFound(CodeSigningMagic),

    #[error("expected a single {0:?} blob but found {1}")]
    AmbiguousBlob(CodeSigningMagic, usize),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(DigestType),

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("digest for {0:?} slot has {1} bytes; code directory expects {2}")]
    DigestLengthMismatch(SpecialSlot, usize, usize),

    #[error("no content available for {0:?} slot")]
    MissingSlotContent(SpecialSlot),

    #[error("signer failure: {0}")]
    Signer(String),

    #[error("signer did not respond within {0:?}")]
    SignerTimeout(Duration),

    #[error("error parsing plist: {0}")]
    PlistParse(plist::Error),

    #[error("bundle Info.plist does not define CFBundleIdentifier: {0}")]
    BundleNoIdentifier(PathBuf),
}

impl ResignError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Only failures of the external signer to answer in time qualify. All
    /// other errors are properties of the input data.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SignerTimeout(_))
    }
}
