// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Producing the cryptographic signature.
//!
//! Certificate selection and CMS construction live outside this crate. We
//! only describe what we hand a signer and what we expect back.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        embedded_signature::{Blob, DigestType},
        error::ResignError,
    },
    std::{
        sync::{mpsc, Arc},
        time::Duration,
    },
};

/// Digests of a single encoded code directory (its CDHashes).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeDirectoryDigest {
    /// Digest algorithm the code directory itself uses.
    pub hash_type: DigestType,
    /// SHA-1 of the encoded code directory blob.
    pub sha1: Vec<u8>,
    /// SHA-256 of the encoded code directory blob.
    pub sha256: Vec<u8>,
}

impl CodeDirectoryDigest {
    /// Compute digests over the encoded form of a code directory.
    pub fn from_code_directory(cd: &CodeDirectoryBlob) -> Result<Self, ResignError> {
        let data = cd.to_blob_bytes()?;

        Ok(Self {
            hash_type: cd.hash_type,
            sha1: DigestType::Sha1.digest_data(&data)?,
            sha256: DigestType::Sha256.digest_data(&data)?,
        })
    }
}

/// An entity capable of producing signature data for code directories.
pub trait CodeSigner: Send + Sync {
    /// Whether this signer has no certificate backed identity.
    fn is_adhoc(&self) -> bool;

    /// Common name of the signing certificate.
    fn common_name(&self) -> &str;

    /// Team identifier to record in code directories.
    ///
    /// `None` leaves existing team identifiers untouched.
    fn team_id(&self) -> Option<&str>;

    /// Produce new signature data.
    ///
    /// Receives the payload of the existing signature blob and the digests of
    /// every final code directory. Returns the payload for the replacement
    /// signature blob (usually CMS SignedData).
    fn sign(
        &self,
        old_signature: &[u8],
        code_directories: &[CodeDirectoryDigest],
    ) -> Result<Vec<u8>, ResignError>;
}

/// A [CodeSigner] that bounds how long [CodeSigner::sign] may take.
///
/// The wrapped signer runs on its own thread. If it hasn't answered in time we
/// stop waiting and return [ResignError::SignerTimeout]; the thread is left
/// to finish on its own and its result discarded.
#[derive(Clone)]
pub struct TimeoutSigner {
    inner: Arc<dyn CodeSigner>,
    timeout: Duration,
}

impl TimeoutSigner {
    pub fn new(inner: Arc<dyn CodeSigner>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl CodeSigner for TimeoutSigner {
    fn is_adhoc(&self) -> bool {
        self.inner.is_adhoc()
    }

    fn common_name(&self) -> &str {
        self.inner.common_name()
    }

    fn team_id(&self) -> Option<&str> {
        self.inner.team_id()
    }

    fn sign(
        &self,
        old_signature: &[u8],
        code_directories: &[CodeDirectoryDigest],
    ) -> Result<Vec<u8>, ResignError> {
        let (tx, rx) = mpsc::channel();

        let inner = self.inner.clone();
        let old_signature = old_signature.to_vec();
        let code_directories = code_directories.to_vec();

        std::thread::spawn(move || {
            // The receiver is gone if we already timed out.
            let _ = tx.send(inner.sign(&old_signature, &code_directories));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(res) => res,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ResignError::SignerTimeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ResignError::Signer(
                "signer terminated without producing a signature".into(),
            )),
        }
    }
}
