// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sources of bundle content sealed by code signatures.

use {
    crate::{error::ResignError, special_slots::SpecialSlot},
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
    },
};

/// A bundle whose main binary is being re-signed.
///
/// Supplies the content hashed into special slots along with identity changes.
pub trait SignableBundle: Send + Sync {
    /// Entitlements plist to embed, if the bundle supplies any.
    fn entitlements(&self) -> Result<Option<Vec<u8>>, ResignError>;

    /// Content of the resource seal (`_CodeSignature/CodeResources`).
    fn resource_seal(&self) -> Result<Vec<u8>, ResignError>;

    /// Content of the `Info.plist` file.
    fn info_plist(&self) -> Result<Vec<u8>, ResignError>;

    /// The new bundle identifier, if it differs from the signed one.
    fn changed_bundle_id(&self) -> Option<&str>;

    /// Whether a present special slot should be recomputed.
    fn should_fill_slot(&self, _slot: SpecialSlot) -> bool {
        true
    }
}

/// A [SignableBundle] backed by a directory on the filesystem.
///
/// Both macOS style bundles (content under `Contents/`) and shallow iOS style
/// bundles are supported.
#[derive(Clone, Debug)]
pub struct DirectoryBundle {
    /// Root directory of this bundle.
    root: PathBuf,

    /// Whether the bundle is shallow.
    ///
    /// If false, content is in a `Contents/` sub-directory.
    shallow: bool,

    /// `CFBundleIdentifier` from `Info.plist`.
    identifier: String,

    new_identifier: Option<String>,
    entitlements: Option<Vec<u8>>,
    skipped_slots: HashSet<SpecialSlot>,
}

impl DirectoryBundle {
    /// Open an existing bundle from a filesystem path.
    ///
    /// The specified path should be the root directory of the bundle. Its
    /// `Info.plist` must exist and define `CFBundleIdentifier`.
    pub fn new_from_path(directory: &Path) -> Result<Self, ResignError> {
        let shallow = !directory.join("Contents").is_dir();

        let mut bundle = Self {
            root: directory.to_path_buf(),
            shallow,
            identifier: String::new(),
            new_identifier: None,
            entitlements: None,
            skipped_slots: HashSet::new(),
        };

        let info_plist_path = bundle.info_plist_path();
        let cursor = std::io::Cursor::new(std::fs::read(&info_plist_path)?);
        let value = plist::Value::from_reader(cursor).map_err(ResignError::PlistParse)?;

        bundle.identifier = value
            .as_dictionary()
            .and_then(|dict| dict.get("CFBundleIdentifier"))
            .and_then(|value| value.as_string())
            .ok_or(ResignError::BundleNoIdentifier(info_plist_path))?
            .to_string();

        Ok(bundle)
    }

    /// Resolve the absolute path to a file in the bundle.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        if self.shallow {
            self.root.join(path.as_ref())
        } else {
            self.root.join("Contents").join(path.as_ref())
        }
    }

    /// The root directory of this bundle.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Obtain the path to the `Info.plist` file.
    pub fn info_plist_path(&self) -> PathBuf {
        self.resolve_path("Info.plist")
    }

    /// Obtain the path to the resource seal.
    pub fn code_resources_path(&self) -> PathBuf {
        self.resolve_path("_CodeSignature").join("CodeResources")
    }

    /// The bundle identifier as currently defined by `Info.plist`.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Re-sign under a different bundle identifier.
    pub fn with_bundle_id(mut self, identifier: impl ToString) -> Self {
        self.new_identifier = Some(identifier.to_string());
        self
    }

    /// Embed the given entitlements plist.
    pub fn with_entitlements(mut self, entitlements: impl Into<Vec<u8>>) -> Self {
        self.entitlements = Some(entitlements.into());
        self
    }

    /// Leave a special slot's existing digest alone.
    ///
    /// Libraries, for example, carry no entitlements.
    pub fn skip_slot(mut self, slot: SpecialSlot) -> Self {
        self.skipped_slots.insert(slot);
        self
    }
}

impl SignableBundle for DirectoryBundle {
    fn entitlements(&self) -> Result<Option<Vec<u8>>, ResignError> {
        Ok(self.entitlements.clone())
    }

    fn resource_seal(&self) -> Result<Vec<u8>, ResignError> {
        Ok(std::fs::read(self.code_resources_path())?)
    }

    fn info_plist(&self) -> Result<Vec<u8>, ResignError> {
        Ok(std::fs::read(self.info_plist_path())?)
    }

    fn changed_bundle_id(&self) -> Option<&str> {
        self.new_identifier
            .as_deref()
            .filter(|identifier| *identifier != self.identifier)
    }

    fn should_fill_slot(&self, slot: SpecialSlot) -> bool {
        !self.skipped_slots.contains(&slot)
    }
}
