// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rewriting the designated requirement for a new identity.
//!
//! Designated requirements produced by Apple's tooling for developer signed
//! code have the shape:
//!
//! ```text
//! identifier "<bundle id>" and (anchor apple generic and
//!     (certificate leaf[subject.CN] = "<common name>" and <more>))
//! ```
//!
//! Re-signing swaps the bundle id and the common name in place. Requirements
//! of other shapes are left alone with a warning: the signature stays valid,
//! but its designated requirement may no longer be satisfied by the new
//! identity.

use {
    crate::{
        code_requirement::{CodeRequirementExpression, CodeRequirementValue},
        embedded_signature::{Blob, BlobData, SuperBlob, BLOB_HEADER_SIZE, SUPERBLOB_HEADER_SIZE},
        error::ResignError,
    },
    log::{debug, warn},
};

/// What [patch_designated_requirement] managed to change.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RequirementPatchReport {
    pub bundle_id_patched: bool,
    pub common_name_patched: bool,
}

/// Find the bundle identifier literal.
fn bundle_identifier_mut(expr: &mut CodeRequirementExpression) -> Option<&mut String> {
    match expr {
        CodeRequirementExpression::And(lhs, _) => match lhs.as_mut() {
            CodeRequirementExpression::Identifier(identifier) => Some(identifier),
            _ => None,
        },
        _ => None,
    }
}

/// Find the signing certificate common name literal.
fn common_name_mut(expr: &mut CodeRequirementExpression) -> Option<&mut CodeRequirementValue> {
    let rhs = match expr {
        CodeRequirementExpression::And(_, rhs) => rhs.as_mut(),
        _ => return None,
    };
    let rhs2 = match rhs {
        CodeRequirementExpression::And(_, rhs2) => rhs2.as_mut(),
        _ => return None,
    };

    match rhs2 {
        CodeRequirementExpression::And(field, _) => match field.as_mut() {
            CodeRequirementExpression::CertificateField(_, _, m) => m.value_mut(),
            _ => None,
        },
        _ => None,
    }
}

/// Rewrite the designated requirement (entry 0 of a requirement set).
///
/// The bundle identifier is replaced when `changed_bundle_id` is set and the
/// certificate common name is always replaced. If entry 0's encoded size
/// changes, the offsets of every later entry shift by the same amount and the
/// set's declared length is recomputed.
///
/// Requirements that don't have the expected shape are not errors. They are
/// logged and reflected in the returned report.
pub fn patch_designated_requirement(
    requirements: &mut SuperBlob,
    changed_bundle_id: Option<&str>,
    common_name: &str,
) -> Result<RequirementPatchReport, ResignError> {
    let mut report = RequirementPatchReport::default();

    let entry = if let Some(entry) = requirements.entries.first_mut() {
        entry
    } else {
        warn!("requirement set is empty; designated requirement not updated");
        return Ok(report);
    };

    let old_length = entry.blob.to_blob_bytes()?.len();

    let expr = match &mut entry.blob {
        BlobData::Requirement(blob) => blob.expression_mut(),
        _ => None,
    };
    let expr = if let Some(expr) = expr {
        expr
    } else {
        warn!("designated requirement is not a parseable expression; leaving it unchanged");
        return Ok(report);
    };

    if let Some(bundle_id) = changed_bundle_id {
        if let Some(identifier) = bundle_identifier_mut(expr) {
            debug!("designated requirement identifier {} -> {}", identifier, bundle_id);
            *identifier = bundle_id.to_string();
            report.bundle_id_patched = true;
        } else {
            warn!("designated requirement has no identifier clause; bundle id not updated");
        }
    }

    if let Some(value) = common_name_mut(expr) {
        debug!("designated requirement common name {} -> {}", value, common_name);
        *value = common_name.into();
        report.common_name_patched = true;
    } else {
        warn!("designated requirement has no certificate common name; it was not updated");
    }

    let new_length = entry.blob.to_blob_bytes()?.len();

    if new_length != old_length {
        let delta = new_length as i64 - old_length as i64;

        for entry in requirements.entries.iter_mut().skip(1) {
            entry.offset = u32::try_from(entry.offset as i64 + delta).map_err(|_| {
                ResignError::MalformedStructure("requirement offset out of range")
            })?;
        }
    }

    requirements.length = (requirements.serialize_payload()?.len() + BLOB_HEADER_SIZE) as u32;

    Ok(report)
}

/// Remove every requirement from a requirement set.
///
/// Ad-hoc signatures carry no certificate, so there is nothing a requirement
/// could meaningfully pin.
pub fn clear_requirements(requirements: &mut SuperBlob) {
    debug!(
        "ad-hoc signing; dropping {} requirements",
        requirements.entries.len()
    );

    requirements.entries.clear();
    requirements.padding.clear();
    requirements.length = SUPERBLOB_HEADER_SIZE as u32;
}
