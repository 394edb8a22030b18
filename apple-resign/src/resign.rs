// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-signing embedded signatures.
//!
//! [Resigner] rewrites an existing embedded signature for a new identity.
//! Code page digests are kept. Everything that depends on the identity or on
//! content outside the binary is regenerated, in order:
//!
//! 1. The entitlements blob payload is replaced.
//! 2. The designated requirement is rewritten (or, for ad-hoc signers, all
//!    requirements are dropped).
//! 3. Special slots, the team identifier and the identifier of every code
//!    directory are updated.
//! 4. The CMS signature is regenerated over the final code directories.
//! 5. Superblob offsets and length are recomputed.

use {
    crate::{
        bundle::SignableBundle,
        embedded_signature::{Blob, SuperBlob},
        error::ResignError,
        requirement_patch::{clear_requirements, patch_designated_requirement},
        settings::ResignSettings,
        signer::{CodeDirectoryDigest, CodeSigner, TimeoutSigner},
        special_slots::{SlotContents, SpecialSlot},
    },
    log::{debug, info},
    std::sync::Arc,
};

/// Re-signs embedded signatures.
#[derive(Clone, Debug, Default)]
pub struct Resigner {
    settings: ResignSettings,
}

impl Resigner {
    /// Construct a new instance with the given settings.
    pub fn new(settings: ResignSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ResignSettings {
        &self.settings
    }

    /// Re-sign encoded embedded signature data.
    ///
    /// Returns the encoded new signature. Nothing is produced unless every
    /// step succeeds.
    pub fn resign_signature_data(
        &self,
        data: &[u8],
        bundle: &dyn SignableBundle,
        signer: Arc<dyn CodeSigner>,
    ) -> Result<Vec<u8>, ResignError> {
        let mut signature = SuperBlob::from_bytes(data)?;
        self.resign(&mut signature, bundle, signer)?;

        signature.to_blob_bytes()
    }

    /// Re-sign a parsed embedded signature in place.
    ///
    /// On error the signature may be partially modified and should be discarded.
    pub fn resign(
        &self,
        signature: &mut SuperBlob,
        bundle: &dyn SignableBundle,
        signer: Arc<dyn CodeSigner>,
    ) -> Result<(), ResignError> {
        let signer: Arc<dyn CodeSigner> = match self.settings.signer_timeout() {
            Some(timeout) => Arc::new(TimeoutSigner::new(signer, timeout)),
            None => signer,
        };
        let signer = signer.as_ref();

        info!("replacing entitlements");
        self.replace_entitlements(signature, bundle)?;

        info!("updating code requirements");
        self.update_requirements(signature, bundle, signer)?;

        info!("rebuilding code directories");
        self.rebuild_code_directories(signature, bundle, signer)?;

        info!("replacing signature");
        self.replace_signature(signature, signer)?;

        info!("reconciling superblob offsets");
        signature.reconcile_offsets()
    }

    /// Replace the payload of the entitlements blob with the bundle's entitlements.
    pub fn replace_entitlements(
        &self,
        signature: &mut SuperBlob,
        bundle: &dyn SignableBundle,
    ) -> Result<(), ResignError> {
        let entitlements = if let Some(entitlements) = bundle.entitlements()? {
            entitlements
        } else {
            debug!("bundle supplies no entitlements");
            return Ok(());
        };

        if let Some(blob) = signature.entitlements_mut()? {
            blob.set_data(entitlements);
        } else {
            debug!("signature has no entitlements blob; entitlements not embedded");
        }

        Ok(())
    }

    /// Rewrite the requirement set for the signer's identity.
    pub fn update_requirements(
        &self,
        signature: &mut SuperBlob,
        bundle: &dyn SignableBundle,
        signer: &dyn CodeSigner,
    ) -> Result<(), ResignError> {
        let requirements = signature.requirements_mut()?;

        if signer.is_adhoc() {
            clear_requirements(requirements);
        } else {
            let report = patch_designated_requirement(
                requirements,
                bundle.changed_bundle_id(),
                signer.common_name(),
            )?;
            debug!("designated requirement patch: {:?}", report);
        }

        Ok(())
    }

    /// Update special slots and identity fields of every code directory.
    ///
    /// Slot content is only loaded for slots at least one code directory fills.
    pub fn rebuild_code_directories(
        &self,
        signature: &mut SuperBlob,
        bundle: &dyn SignableBundle,
        signer: &dyn CodeSigner,
    ) -> Result<(), ResignError> {
        let approved = |slot: SpecialSlot| {
            bundle.should_fill_slot(slot)
                && !(slot == SpecialSlot::Entitlements && signer.is_adhoc())
        };

        let slots = SpecialSlot::ALL
            .iter()
            .copied()
            .filter(|slot| approved(*slot))
            .filter(|slot| {
                signature
                    .code_directories()
                    .any(|cd| slot.is_present(cd.n_special_slots()))
            })
            .collect::<Vec<_>>();

        let contents = SlotContents::load(signature, bundle, slots.iter().copied())?;

        let team_id = signer.team_id();
        let bundle_id = bundle.changed_bundle_id();

        for cd in signature.code_directories_mut() {
            for slot in &slots {
                if slot.is_present(cd.n_special_slots()) {
                    cd.set_special_hash(*slot, slot.digest(cd.hash_type, &contents)?)?;
                }
            }

            if let Some(team_id) = team_id {
                cd.set_team_id(team_id)?;
            }

            if let Some(bundle_id) = bundle_id {
                cd.set_identifier(bundle_id)?;
            }

            let digest = CodeDirectoryDigest::from_code_directory(cd)?;
            debug!(
                "{} code directory for {}: CDHash sha1 {}, sha256 {}",
                cd.hash_type,
                cd.ident(),
                hex::encode(&digest.sha1),
                hex::encode(&digest.sha256)
            );
        }

        Ok(())
    }

    /// Regenerate the signature over the final code directories.
    pub fn replace_signature(
        &self,
        signature: &mut SuperBlob,
        signer: &dyn CodeSigner,
    ) -> Result<(), ResignError> {
        let old_signature = signature.signature_wrapper()?.payload().to_vec();

        let code_directories = signature
            .code_directories()
            .map(CodeDirectoryDigest::from_code_directory)
            .collect::<Result<Vec<_>, _>>()?;

        let new_signature = signer.sign(&old_signature, &code_directories)?;
        signature.signature_wrapper_mut()?.set_payload(new_signature);

        Ok(())
    }
}
