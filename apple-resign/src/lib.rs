// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-signing Apple code signatures.
//!
//! This crate rewrites the embedded code signature of an already signed
//! Mach-O binary so it carries a new identity: a new signing certificate, team
//! identifier, entitlements and optionally bundle identifier. Code page
//! digests are preserved. Everything depending on the identity is
//! regenerated and the signature's binary layout is kept consistent.
//!
//! Locating the signature within a Mach-O file and producing CMS signature
//! data are left to the caller. The former is a matter of following the
//! `LC_CODE_SIGNATURE` load command. The latter is abstracted by the
//! [CodeSigner] trait.
//!
//! # Features and Capabilities
//!
//! * Parse embedded signature superblobs into Rust structs and serialize them
//!   back byte for byte. (See [SuperBlob], [BlobData], [CodeDirectoryBlob] and
//!   [RequirementBlob].)
//! * Parse binary code requirement expressions and rewrite their literals.
//! * Recompute special slot digests from signature content and bundle files.
//!   (See [SpecialSlot] and [SignableBundle].)
//! * Rewrite the designated requirement for a new certificate and bundle
//!   identifier.
//! * Drive the whole re-signing sequence. (See [Resigner].)
//!
//! # Known limitations
//!
//! * Only SHA-1 and SHA-256 code directories can be rebuilt.
//! * Code page digests are never recomputed, so the Mach-O itself must not
//!   have changed.
//! * Designated requirements not matching the shape Apple's tooling generates
//!   are left untouched.

mod bundle;
pub use bundle::*;
mod code_directory;
pub use code_directory::*;
pub mod code_requirement;
pub use code_requirement::*;
pub mod embedded_signature;
pub use embedded_signature::*;
mod error;
pub use error::*;
pub mod requirement_patch;
pub use requirement_patch::*;
mod resign;
pub use resign::*;
mod settings;
pub use settings::*;
mod signer;
pub use signer::*;
mod special_slots;
pub use special_slots::*;
