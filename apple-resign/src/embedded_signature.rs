// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common embedded signature data structures (superblobs, magic values, etc).
//!
//! This module defines types and data structures that are common to Apple's
//! embedded signature format.
//!
//! The best source of the specification comes from Apple's open source headers,
//! notably cs_blobs.h (e.g.
//! <https://opensource.apple.com/source/xnu/xnu-7195.81.3/osfmk/kern/cs_blobs.h.auto.html>).
//!
//! The high-level format of embedded signature data is roughly as follows:
//!
//! * A `SuperBlob` header describes the total length of data and the number of
//!   *blob* sections that follow.
//! * An array of `BlobIndex` describing the type and offset of all *blob* sections
//!   that follow. The *type* here is a *slot* and describes what type of data the
//!   *blob* contains (code directory, entitlements, embedded signature, etc).
//! * N *blob* sections of varying formats and lengths.
//!
//! Unlike a reader that only needs to look at signature data, re-signing mutates
//! the parsed structure and writes it back. So everything in here is owned and
//! every type can serialize itself back to the exact bytes it was parsed from.
//! [SuperBlob] is the entry point: it holds an ordered list of [BlobIndexEntry],
//! each owning a [BlobData] whose variant is selected by the blob's magic.

use {
    crate::{
        code_directory::CodeDirectoryBlob, code_requirement::RequirementBlob,
        error::ResignError,
    },
    scroll::{IOwrite, Pread},
    std::{
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Size of the header common to all blobs: u32 magic + u32 length.
pub const BLOB_HEADER_SIZE: usize = 8;

/// Size of a superblob header: blob header + u32 count.
pub const SUPERBLOB_HEADER_SIZE: usize = BLOB_HEADER_SIZE + 4;

/// Size of each `(type, offset)` entry in a superblob index.
pub const BLOB_INDEX_SIZE: usize = 8;

/// Defines header magic for various payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Code requirements blob.
    RequirementSet,
    /// CodeDirectory blob.
    CodeDirectory,
    /// Embedded signature.
    ///
    /// This is often the magic of the SuperBlob.
    EmbeddedSignature,
    /// Old embedded signature.
    EmbeddedSignatureOld,
    /// Entitlements blob.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// Multi-arch collection of embedded signatures.
    DetachedSignature,
    /// Generic blob wrapper.
    ///
    /// The CMS signature is stored in this type.
    BlobWrapper,
    /// Unknown magic.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade0b02 => Self::EmbeddedSignatureOld,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::EmbeddedSignatureOld => 0xfade0b02,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

impl CodeSigningMagic {
    /// Whether blobs with this magic carry a nested index of blobs.
    pub fn is_superblob(&self) -> bool {
        matches!(
            self,
            Self::EmbeddedSignature | Self::DetachedSignature | Self::RequirementSet
        )
    }
}

/// Represents a digest type encountered in code signature data structures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestType::None => f.write_str("none"),
            DigestType::Sha1 => f.write_str("sha1"),
            DigestType::Sha256 => f.write_str("sha256"),
            DigestType::Sha256Truncated => f.write_str("sha256-truncated"),
            DigestType::Sha384 => f.write_str("sha384"),
            DigestType::Sha512 => f.write_str("sha512"),
            DigestType::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl DigestType {
    /// Obtain the size of hashes for this hash type.
    pub fn hash_len(&self) -> Result<usize, ResignError> {
        match self {
            Self::Sha1 => Ok(20),
            Self::Sha256 => Ok(32),
            _ => Err(ResignError::UnsupportedAlgorithm(*self)),
        }
    }

    /// Obtain a hasher for this digest type.
    ///
    /// Only the legacy SHA-1 and the modern SHA-256 code directory algorithms
    /// can be produced when re-signing.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, ResignError> {
        match self {
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 => Ok(ring::digest::Context::new(&ring::digest::SHA256)),
            _ => Err(ResignError::UnsupportedAlgorithm(*self)),
        }
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, ResignError> {
        let mut hasher = self.as_hasher()?;

        hasher.update(data);

        Ok(hasher.finish().as_ref().to_vec())
    }
}

/// A raw digest value stored in a code directory.
#[derive(Clone, Eq, PartialEq)]
pub struct Digest {
    pub data: Vec<u8>,
}

impl Digest {
    /// Construct a digest consisting of `len` NULL bytes.
    pub fn null(len: usize) -> Self {
        Self {
            data: vec![0; len],
        }
    }

    /// Whether this is the null hash (all 0s).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl From<Vec<u8>> for Digest {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Read the header from a Blob.
///
/// Blobs begin with a u32 magic and u32 length, inclusive. The returned length
/// is validated to cover at least the header and to not exceed `data`.
pub(crate) fn read_blob_header(data: &[u8]) -> Result<(u32, usize), ResignError> {
    if data.len() < BLOB_HEADER_SIZE {
        return Err(ResignError::MalformedStructure("blob header truncated"));
    }

    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)? as usize;

    if length < BLOB_HEADER_SIZE {
        Err(ResignError::MalformedStructure(
            "blob length smaller than its header",
        ))
    } else if length > data.len() {
        Err(ResignError::MalformedStructure(
            "blob length exceeds available data",
        ))
    } else {
        Ok((magic, length))
    }
}

/// Read and validate a blob header, returning the payload bounded by the declared length.
pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], ResignError> {
    let (magic, length) = read_blob_header(data)?;

    if magic != expected_magic {
        Err(ResignError::BadMagic(what))
    } else {
        Ok(&data[BLOB_HEADER_SIZE..length])
    }
}

/// Provides common features for a parsed blob type.
pub trait Blob
where
    Self: Sized,
{
    /// The header magic that identifies this blob.
    fn magic(&self) -> u32;

    /// Attempt to construct an instance by parsing a bytes slice.
    ///
    /// The slice begins with the 8 byte blob header denoting the magic
    /// and length. Data past the declared length is ignored.
    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError>;

    /// Serialize the payload of this blob to bytes.
    ///
    /// Does not include the magic or length header fields common to blobs.
    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError>;

    /// Serialize this blob to bytes.
    ///
    /// This is [Blob::serialize_payload] with the blob magic and length
    /// prepended.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, ResignError> {
        let payload = self.serialize_payload()?;

        let mut res = Vec::with_capacity(payload.len() + BLOB_HEADER_SIZE);
        res.iowrite_with(self.magic(), scroll::BE)?;
        // Length includes our own header.
        res.iowrite_with((payload.len() + BLOB_HEADER_SIZE) as u32, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }

    /// Obtain the digest of the blob using the specified hasher.
    ///
    /// The digest covers the entire blob, header included.
    fn digest_with(&self, hash_type: DigestType) -> Result<Vec<u8>, ResignError> {
        hash_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// Represents an Entitlements blob.
///
/// The payload is an XML plist. We never interpret it: entitlements are
/// provided by the bundle being signed and are copied in verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntitlementsBlob {
    data: Vec<u8>,
}

impl Blob for EntitlementsBlob {
    fn magic(&self) -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let data = read_and_validate_blob_header(
            data,
            u32::from(CodeSigningMagic::Entitlements),
            "entitlements blob",
        )?;

        Ok(Self {
            data: data.to_vec(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError> {
        Ok(self.data.clone())
    }
}

impl EntitlementsBlob {
    /// Construct an instance from raw entitlements plist data.
    pub fn from_data(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Replace the entitlements payload.
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }
}

/// Represents a generic blob wrapper.
#[derive(Clone, Eq, PartialEq)]
pub struct BlobWrapperBlob {
    data: Vec<u8>,
}

impl Blob for BlobWrapperBlob {
    fn magic(&self) -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError> {
        Ok(Self {
            data: read_and_validate_blob_header(
                data,
                u32::from(CodeSigningMagic::BlobWrapper),
                "blob wrapper blob",
            )?
            .to_vec(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError> {
        Ok(self.data.clone())
    }
}

impl std::fmt::Debug for BlobWrapperBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(&self.data)))
    }
}

impl BlobWrapperBlob {
    /// Construct an instance with payload data.
    pub fn from_data(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// The wrapped payload (post blob header).
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Replace the wrapped payload.
    pub fn set_payload(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }
}

/// Represents an unknown blob type.
///
/// Blobs we don't have a schema for are carried through untouched.
#[derive(Clone, Eq, PartialEq)]
pub struct OtherBlob {
    pub magic: u32,
    pub data: Vec<u8>,
}

impl Blob for OtherBlob {
    fn magic(&self) -> u32 {
        self.magic
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let (magic, length) = read_blob_header(data)?;

        Ok(Self {
            magic,
            data: data[BLOB_HEADER_SIZE..length].to_vec(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError> {
        Ok(self.data.clone())
    }
}

impl std::fmt::Debug for OtherBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "OtherBlob({:#x}, {})",
            self.magic,
            hex::encode(&self.data)
        ))
    }
}

/// Represents a single, parsed Blob entry/slot.
///
/// The variant is chosen by the blob's magic. Unknown magic values become
/// [BlobData::Other].
#[derive(Clone, Debug, PartialEq)]
pub enum BlobData {
    Requirement(Box<RequirementBlob>),
    SuperBlob(Box<SuperBlob>),
    CodeDirectory(Box<CodeDirectoryBlob>),
    Entitlements(Box<EntitlementsBlob>),
    BlobWrapper(Box<BlobWrapperBlob>),
    Other(Box<OtherBlob>),
}

impl Blob for BlobData {
    fn magic(&self) -> u32 {
        match self {
            Self::Requirement(b) => b.magic(),
            Self::SuperBlob(b) => b.magic(),
            Self::CodeDirectory(b) => b.magic(),
            Self::Entitlements(b) => b.magic(),
            Self::BlobWrapper(b) => b.magic(),
            Self::Other(b) => b.magic(),
        }
    }

    /// Parse blob data by reading its magic and feeding into magic-specific parser.
    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let (magic, length) = read_blob_header(data)?;

        let data = &data[0..length];

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            magic if magic.is_superblob() => {
                Self::SuperBlob(Box::new(SuperBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError> {
        match self {
            Self::Requirement(b) => b.serialize_payload(),
            Self::SuperBlob(b) => b.serialize_payload(),
            Self::CodeDirectory(b) => b.serialize_payload(),
            Self::Entitlements(b) => b.serialize_payload(),
            Self::BlobWrapper(b) => b.serialize_payload(),
            Self::Other(b) => b.serialize_payload(),
        }
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, ResignError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::SuperBlob(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }
}

impl From<RequirementBlob> for BlobData {
    fn from(b: RequirementBlob) -> Self {
        Self::Requirement(Box::new(b))
    }
}

impl From<SuperBlob> for BlobData {
    fn from(b: SuperBlob) -> Self {
        Self::SuperBlob(Box::new(b))
    }
}

impl From<CodeDirectoryBlob> for BlobData {
    fn from(b: CodeDirectoryBlob) -> Self {
        Self::CodeDirectory(Box::new(b))
    }
}

impl From<EntitlementsBlob> for BlobData {
    fn from(b: EntitlementsBlob) -> Self {
        Self::Entitlements(Box::new(b))
    }
}

impl From<BlobWrapperBlob> for BlobData {
    fn from(b: BlobWrapperBlob) -> Self {
        Self::BlobWrapper(Box::new(b))
    }
}

impl From<OtherBlob> for BlobData {
    fn from(b: OtherBlob) -> Self {
        Self::Other(Box::new(b))
    }
}

/// A single entry in a superblob index, along with the blob it points to.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobIndexEntry {
    /// Slot type of this entry.
    ///
    /// In an embedded signature, this is a slot number (0 for the code
    /// directory, 0x10000 for the signature, etc). In a requirement set, it is
    /// a [crate::RequirementType].
    pub typ: u32,

    /// Start offset of the blob relative to the start of the superblob.
    pub offset: u32,

    /// The parsed blob.
    pub blob: BlobData,
}

/// A blob holding an index of nested blobs.
///
/// Embedded signatures, detached signatures and requirement sets all share this
/// layout. Entry order is preserved as parsed, as are any bytes between the end
/// of the index and the first blob.
///
/// The header `length` and the per entry `offset` fields are stored verbatim
/// rather than computed, since re-signing adjusts them explicitly. Serializing an
/// instance whose stored values don't describe its content is an error; use
/// [SuperBlob::reconcile_offsets] after changing nested blobs.
#[derive(Clone, Debug, PartialEq)]
pub struct SuperBlob {
    /// Magic value from header.
    pub magic: CodeSigningMagic,
    /// Declared length of this super blob, header included.
    pub length: u32,
    /// Bytes between the end of the index and the first blob.
    pub padding: Vec<u8>,
    /// All the blobs within this super blob.
    pub entries: Vec<BlobIndexEntry>,
}

impl Blob for SuperBlob {
    fn magic(&self) -> u32 {
        u32::from(self.magic)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let (magic, length) = read_blob_header(data)?;
        let magic = CodeSigningMagic::from(magic);

        if !magic.is_superblob() {
            return Err(ResignError::BadMagic("super blob"));
        }

        let data = &data[0..length];

        if data.len() < SUPERBLOB_HEADER_SIZE {
            return Err(ResignError::MalformedStructure("superblob header truncated"));
        }

        let mut offset = BLOB_HEADER_SIZE;
        let count = data.gread_with::<u32>(&mut offset, scroll::BE)? as usize;

        match count
            .checked_mul(BLOB_INDEX_SIZE)
            .and_then(|size| size.checked_add(SUPERBLOB_HEADER_SIZE))
        {
            Some(index_end) if index_end <= data.len() => {}
            _ => {
                return Err(ResignError::MalformedStructure(
                    "superblob index exceeds blob length",
                ));
            }
        }

        // Following the SuperBlob header is an array of .count BlobIndex defining
        // the Blob that follow. The BlobIndex doesn't declare the length of each
        // Blob: that comes from the header of the blob itself.
        let mut indices = Vec::with_capacity(count);
        for _ in 0..count {
            indices.push((
                data.gread_with::<u32>(&mut offset, scroll::BE)?,
                data.gread_with::<u32>(&mut offset, scroll::BE)?,
            ));
        }

        let index_end = offset;
        let base = indices
            .first()
            .map(|(_, offset)| *offset as usize)
            .unwrap_or(data.len());

        if base < index_end {
            return Err(ResignError::MalformedStructure(
                "blob offset overlaps superblob index",
            ));
        }
        if base > data.len() {
            return Err(ResignError::MalformedStructure(
                "blob offset exceeds superblob length",
            ));
        }

        let padding = data[index_end..base].to_vec();

        let mut entries = Vec::with_capacity(indices.len());
        let mut position = base;

        for (typ, offset) in indices {
            if offset as usize != position {
                return Err(ResignError::MalformedStructure(
                    "superblob entries are not contiguous",
                ));
            }

            let (_, blob_length) = read_blob_header(&data[position..])?;
            let blob = BlobData::from_blob_bytes(&data[position..position + blob_length])?;

            entries.push(BlobIndexEntry { typ, offset, blob });
            position += blob_length;
        }

        if position != data.len() {
            return Err(ResignError::MalformedStructure(
                "trailing data after last superblob entry",
            ));
        }

        Ok(Self {
            magic,
            length: length as u32,
            padding,
            entries,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError> {
        let blobs = self
            .entries
            .iter()
            .map(|entry| entry.blob.to_blob_bytes())
            .collect::<Result<Vec<_>, ResignError>>()?;

        let mut res = Vec::new();
        res.iowrite_with(self.entries.len() as u32, scroll::BE)?;

        let mut position = self.base_offset();
        for (entry, blob) in self.entries.iter().zip(blobs.iter()) {
            if entry.offset as usize != position {
                return Err(ResignError::MalformedStructure(
                    "superblob index offsets are stale",
                ));
            }

            res.iowrite_with(entry.typ, scroll::BE)?;
            res.iowrite_with(entry.offset, scroll::BE)?;
            position += blob.len();
        }

        res.write_all(&self.padding)?;
        for blob in blobs {
            res.write_all(&blob)?;
        }

        Ok(res)
    }

    // The declared length is a stored field, so verify it instead of deriving it.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, ResignError> {
        let payload = self.serialize_payload()?;

        if self.length as usize != payload.len() + BLOB_HEADER_SIZE {
            return Err(ResignError::MalformedStructure("superblob length is stale"));
        }

        let mut res = Vec::with_capacity(self.length as usize);
        res.iowrite_with(self.magic(), scroll::BE)?;
        res.iowrite_with(self.length, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }
}

impl SuperBlob {
    /// Construct an empty instance with the given magic.
    pub fn new(magic: CodeSigningMagic) -> Self {
        Self {
            magic,
            length: SUPERBLOB_HEADER_SIZE as u32,
            padding: vec![],
            entries: vec![],
        }
    }

    /// Construct an instance from a list of `(type, blob)` pairs.
    ///
    /// Offsets and the length are computed so the result is immediately serializable.
    pub fn from_blobs(
        magic: CodeSigningMagic,
        blobs: impl IntoIterator<Item = (u32, BlobData)>,
    ) -> Result<Self, ResignError> {
        let mut res = Self::new(magic);
        res.entries = blobs
            .into_iter()
            .map(|(typ, blob)| BlobIndexEntry {
                typ,
                offset: 0,
                blob,
            })
            .collect();
        res.reconcile_offsets()?;

        Ok(res)
    }

    /// Parse an embedded signature super blob from data.
    ///
    /// The argument to this function is likely the subset of the
    /// `__LINKEDIT` Mach-O section that the `LC_CODE_SIGNATURE` load instructions
    /// points it. Data after the declared superblob length (the load command's
    /// region is typically padded) is ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let (magic, _) = read_blob_header(data)?;

        if CodeSigningMagic::from(magic) != CodeSigningMagic::EmbeddedSignature {
            return Err(ResignError::BadMagic("embedded signature super blob"));
        }

        Self::from_blob_bytes(data)
    }

    /// Offset at which the first blob starts.
    ///
    /// This is the superblob header, the index, and any padding following the index.
    pub fn base_offset(&self) -> usize {
        SUPERBLOB_HEADER_SIZE + BLOB_INDEX_SIZE * self.entries.len() + self.padding.len()
    }

    /// Recompute index offsets and the declared length from current blob content.
    ///
    /// Entries keep their order. Starting at the base offset, every entry is assigned
    /// the running position, which then advances by that blob's encoded size. Only
    /// this superblob's own fields are touched; nested superblobs must already be
    /// consistent.
    pub fn reconcile_offsets(&mut self) -> Result<(), ResignError> {
        let mut position = self.base_offset();

        for entry in self.entries.iter_mut() {
            entry.offset = position as u32;
            position += entry.blob.to_blob_bytes()?.len();
        }

        self.length = position as u32;

        Ok(())
    }

    /// Obtain all blobs having the specified magic, in index order.
    pub fn find_blobs(&self, magic: CodeSigningMagic) -> impl Iterator<Item = &BlobData> {
        let magic = u32::from(magic);

        self.entries
            .iter()
            .map(|entry| &entry.blob)
            .filter(move |blob| blob.magic() == magic)
    }

    /// Find the single blob having the specified magic.
    ///
    /// Returns `Ok(None)` if no such blob exists and [ResignError::AmbiguousBlob] if
    /// more than one does.
    pub fn find_blob(&self, magic: CodeSigningMagic) -> Result<Option<&BlobData>, ResignError> {
        let mut blobs = self.find_blobs(magic);
        let first = blobs.next();

        match blobs.count() {
            0 => Ok(first),
            extra => Err(ResignError::AmbiguousBlob(magic, extra + 1)),
        }
    }

    /// Obtain the single blob having the specified magic, which must exist.
    pub fn get_blob(&self, magic: CodeSigningMagic) -> Result<&BlobData, ResignError> {
        self.find_blob(magic)?
            .ok_or(ResignError::BlobNotFound(magic))
    }

    /// Mutable variant of [Self::find_blob].
    pub fn find_blob_mut(
        &mut self,
        magic: CodeSigningMagic,
    ) -> Result<Option<&mut BlobData>, ResignError> {
        // Resolve ambiguity first so the mutable search below has a single answer.
        self.find_blob(magic)?;

        let magic = u32::from(magic);

        Ok(self
            .entries
            .iter_mut()
            .map(|entry| &mut entry.blob)
            .find(|blob| blob.magic() == magic))
    }

    /// Mutable variant of [Self::get_blob].
    pub fn get_blob_mut(&mut self, magic: CodeSigningMagic) -> Result<&mut BlobData, ResignError> {
        self.find_blob_mut(magic)?
            .ok_or(ResignError::BlobNotFound(magic))
    }

    /// Obtain the encoded bytes of the single blob having the specified magic.
    pub fn get_blob_data(&self, magic: CodeSigningMagic) -> Result<Vec<u8>, ResignError> {
        self.get_blob(magic)?.to_blob_bytes()
    }

    /// Obtain all code directories, in index order.
    ///
    /// There is a code directory for each digest algorithm the binary was signed with.
    pub fn code_directories(&self) -> impl Iterator<Item = &CodeDirectoryBlob> {
        self.entries.iter().filter_map(|entry| match &entry.blob {
            BlobData::CodeDirectory(cd) => Some(cd.as_ref()),
            _ => None,
        })
    }

    /// Mutable variant of [Self::code_directories].
    pub fn code_directories_mut(&mut self) -> impl Iterator<Item = &mut CodeDirectoryBlob> {
        self.entries.iter_mut().filter_map(|entry| match &mut entry.blob {
            BlobData::CodeDirectory(cd) => Some(cd.as_mut()),
            _ => None,
        })
    }

    /// Obtain the requirement set, which must exist.
    pub fn requirements(&self) -> Result<&SuperBlob, ResignError> {
        match self.get_blob(CodeSigningMagic::RequirementSet)? {
            BlobData::SuperBlob(reqs) => Ok(reqs.as_ref()),
            _ => Err(ResignError::BadMagic("requirements blob")),
        }
    }

    /// Mutable variant of [Self::requirements].
    pub fn requirements_mut(&mut self) -> Result<&mut SuperBlob, ResignError> {
        match self.get_blob_mut(CodeSigningMagic::RequirementSet)? {
            BlobData::SuperBlob(reqs) => Ok(reqs.as_mut()),
            _ => Err(ResignError::BadMagic("requirements blob")),
        }
    }

    /// Obtain the entitlements blob, if present.
    pub fn entitlements(&self) -> Result<Option<&EntitlementsBlob>, ResignError> {
        match self.find_blob(CodeSigningMagic::Entitlements)? {
            Some(BlobData::Entitlements(blob)) => Ok(Some(blob.as_ref())),
            Some(_) => Err(ResignError::BadMagic("entitlements blob")),
            None => Ok(None),
        }
    }

    /// Mutable variant of [Self::entitlements].
    pub fn entitlements_mut(&mut self) -> Result<Option<&mut EntitlementsBlob>, ResignError> {
        match self.find_blob_mut(CodeSigningMagic::Entitlements)? {
            Some(BlobData::Entitlements(blob)) => Ok(Some(blob.as_mut())),
            Some(_) => Err(ResignError::BadMagic("entitlements blob")),
            None => Ok(None),
        }
    }

    /// Obtain the blob wrapper holding the CMS signature.
    ///
    /// The signature is assumed to be the only blob wrapper at this level. That is a
    /// property of how signatures are laid out, not something the slot or magic
    /// guarantees, so multiple wrappers are refused as ambiguous.
    pub fn signature_wrapper(&self) -> Result<&BlobWrapperBlob, ResignError> {
        match self.get_blob(CodeSigningMagic::BlobWrapper)? {
            BlobData::BlobWrapper(blob) => Ok(blob.as_ref()),
            _ => Err(ResignError::BadMagic("blob wrapper blob")),
        }
    }

    /// Mutable variant of [Self::signature_wrapper].
    pub fn signature_wrapper_mut(&mut self) -> Result<&mut BlobWrapperBlob, ResignError> {
        match self.get_blob_mut(CodeSigningMagic::BlobWrapper)? {
            BlobData::BlobWrapper(blob) => Ok(blob.as_mut()),
            _ => Err(ResignError::BadMagic("blob wrapper blob")),
        }
    }
}
