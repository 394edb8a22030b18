// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-signing settings.

use {log::info, std::time::Duration};

/// How long to wait for a signer unless told otherwise.
pub const DEFAULT_SIGNER_TIMEOUT: Duration = Duration::from_secs(120);

/// Represents settings that influence re-signing.
///
/// Instances are constructed with [Default] and then customized via setters.
#[derive(Clone, Debug)]
pub struct ResignSettings {
    signer_timeout: Option<Duration>,
}

impl Default for ResignSettings {
    fn default() -> Self {
        Self {
            signer_timeout: Some(DEFAULT_SIGNER_TIMEOUT),
        }
    }
}

impl ResignSettings {
    /// Obtain the maximum time to wait for a signer to produce a signature.
    ///
    /// `None` means wait indefinitely.
    pub fn signer_timeout(&self) -> Option<Duration> {
        self.signer_timeout
    }

    /// Set the maximum time to wait for a signer to produce a signature.
    pub fn set_signer_timeout(&mut self, timeout: Duration) {
        info!("signer timeout set to {:?}", timeout);
        self.signer_timeout = Some(timeout);
    }

    /// Wait for the signer for as long as it takes.
    pub fn clear_signer_timeout(&mut self) {
        info!("signer timeout disabled");
        self.signer_timeout = None;
    }
}
