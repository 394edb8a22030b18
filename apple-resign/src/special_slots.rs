// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Special slot digests.
//!
//! Code directories seal more than code pages: a handful of *special* slots
//! record digests of the Info.plist, the requirement set, the resource seal,
//! the entitlements and an application specific slot. These are stored in
//! front of the code digests, with slot N at `hashOffset - N * hashSize`.

use {
    crate::{
        bundle::SignableBundle,
        embedded_signature::{Blob, CodeSigningMagic, Digest, DigestType, SuperBlob},
        error::ResignError,
    },
    std::collections::HashMap,
};

/// A special slot in a code directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SpecialSlot {
    Entitlements,
    Application,
    ResourceDirectory,
    Requirements,
    Info,
}

impl SpecialSlot {
    /// All special slots, nearest to the code digests first.
    pub const ALL: [SpecialSlot; 5] = [
        Self::Info,
        Self::Requirements,
        Self::ResourceDirectory,
        Self::Application,
        Self::Entitlements,
    ];

    /// Position of the slot's digest relative to `hashOffset`, in digests.
    pub fn relative_offset(&self) -> i32 {
        match self {
            Self::Entitlements => -5,
            Self::Application => -4,
            Self::ResourceDirectory => -3,
            Self::Requirements => -2,
            Self::Info => -1,
        }
    }

    /// Index of this slot in a special digests array of `n_special_slots` entries.
    ///
    /// Returns `None` when the array doesn't reach this slot.
    pub fn index(&self, n_special_slots: u32) -> Option<usize> {
        let index = n_special_slots as i64 + self.relative_offset() as i64;

        if index >= 0 {
            Some(index as usize)
        } else {
            None
        }
    }

    /// Whether a code directory with `n_special_slots` special digests has this slot.
    pub fn is_present(&self, n_special_slots: u32) -> bool {
        self.index(n_special_slots).is_some()
    }

    /// Compute the digest to record in this slot.
    ///
    /// The application slot always holds a null digest. Every other slot holds
    /// the digest of its content.
    pub fn digest(&self, hash_type: DigestType, contents: &SlotContents) -> Result<Digest, ResignError> {
        if *self == Self::Application {
            return Ok(Digest::null(hash_type.hash_len()?));
        }

        let data = contents.get(*self).ok_or(match self {
            Self::Entitlements => ResignError::BlobNotFound(CodeSigningMagic::Entitlements),
            Self::Requirements => ResignError::BlobNotFound(CodeSigningMagic::RequirementSet),
            _ => ResignError::MissingSlotContent(*self),
        })?;

        Ok(Digest::from(hash_type.digest_data(data)?))
    }
}

/// Content sealed by special slots.
///
/// Blob backed content is the full encoded blob, header included.
#[derive(Clone, Debug, Default)]
pub struct SlotContents {
    contents: HashMap<SpecialSlot, Vec<u8>>,
}

impl SlotContents {
    pub fn get(&self, slot: SpecialSlot) -> Option<&[u8]> {
        self.contents.get(&slot).map(|data| data.as_slice())
    }

    pub fn insert(&mut self, slot: SpecialSlot, data: Vec<u8>) {
        self.contents.insert(slot, data);
    }

    /// Load the content of the given slots.
    ///
    /// Entitlements and requirements come from the signature. The resource seal
    /// and Info.plist come from the bundle. Missing signature blobs are left out
    /// so the digest reports which one was needed.
    pub fn load(
        signature: &SuperBlob,
        bundle: &dyn SignableBundle,
        slots: impl IntoIterator<Item = SpecialSlot>,
    ) -> Result<Self, ResignError> {
        let mut res = Self::default();

        for slot in slots {
            let data = match slot {
                SpecialSlot::Entitlements => signature
                    .entitlements()?
                    .map(|blob| blob.to_blob_bytes())
                    .transpose()?,
                SpecialSlot::Requirements => signature
                    .find_blob(CodeSigningMagic::RequirementSet)?
                    .map(|blob| blob.to_blob_bytes())
                    .transpose()?,
                SpecialSlot::ResourceDirectory => Some(bundle.resource_seal()?),
                SpecialSlot::Info => Some(bundle.info_plist()?),
                SpecialSlot::Application => None,
            };

            if let Some(data) = data {
                res.insert(slot, data);
            }
        }

        Ok(res)
    }
}
