// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.
//!
//! A code directory is a fixed, versioned header followed by a variable area
//! holding the identifier string, the optional team identifier string and
//! the special and code slot digests. The header records where each of those
//! lives, but nothing forces producers to pack them tightly or in a particular
//! order. So we remember the order the regions appeared in, along with any
//! bytes between them, and rebuild the variable area from that layout when
//! serializing. Changing the length of one region then moves everything after
//! it and the header offsets follow.

use {
    crate::{
        embedded_signature::{read_blob_header, Blob, CodeSigningMagic, Digest, DigestType},
        error::ResignError,
        special_slots::SpecialSlot,
    },
    log::warn,
    scroll::{IOwrite, Pread},
    std::io::Write,
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

impl CodeDirectoryVersion {
    /// Size of the fixed header, blob header included, for a given version value.
    pub fn header_size(version: u32) -> usize {
        if version < Self::SupportsScatter as u32 {
            0x2c
        } else if version < Self::SupportsTeamId as u32 {
            0x30
        } else if version < Self::SupportsCodeLimit64 as u32 {
            0x34
        } else if version < Self::SupportsExecutableSegment as u32 {
            0x40
        } else if version < Self::SupportsRuntime as u32 {
            0x58
        } else if version < Self::SupportsLinkage as u32 {
            0x60
        } else {
            0x6c
        }
    }
}

/// A region of the variable area following the fixed header.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    /// NUL terminated identifier.
    Identifier,
    /// NUL terminated team identifier.
    TeamId,
    /// Special slot digests immediately followed by code slot digests.
    Hashes,
    /// Bytes not claimed by any known region.
    Raw(Vec<u8>),
}

/// Position of data referenced by a header offset field we don't interpret.
///
/// Anchoring the offset to the region holding the data lets it follow that
/// region when earlier regions change length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RegionOffset {
    /// Inside the fixed header, which never moves.
    Fixed(u32),
    /// `delta` bytes into the `ordinal`th [Segment::Raw] of the layout.
    Raw { ordinal: usize, delta: usize },
}

fn get_hashes(data: &[u8], offset: usize, count: usize, hash_size: usize) -> Vec<Digest> {
    (0..count)
        .map(|i| Digest::from(data[offset + i * hash_size..offset + (i + 1) * hash_size].to_vec()))
        .collect()
}

/// Read a NUL terminated string, returning it and the offset after the NUL.
fn read_c_string(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let tail = data.get(offset..)?;
    let len = tail.iter().position(|b| *b == 0)?;
    let s = std::str::from_utf8(&tail[..len]).ok()?;

    Some((s.to_string(), offset + len + 1))
}

/// Represents a code directory blob entry.
///
/// This struct is versioned and has been extended over time.
///
/// The struct here represents a superset of all fields in all versions.
///
/// The parser will set `Option<T>` fields to `None` for instances
/// where the version is lower than the version that field was introduced in.
///
/// `hashOffset`, `identOffset`, the team offset and the slot counts are not
/// stored: they are derived from the variable area when serializing. The
/// scatter, pre-encryption and linkage offsets are anchored to the unclaimed
/// bytes they point into and move with them.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeDirectoryBlob {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// Limit to main image signature range.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. (stored as log u8)
    pub page_size: u32,
    /// Unused (must be 0).
    pub spare2: u32,
    // Version 0x20100
    /// Optional scatter vector, carried in the variable area.
    scatter: Option<RegionOffset>,
    // Version 0x20300
    /// Unused (must be 0).
    pub spare3: Option<u32>,
    /// Limit to main image signature range, 64 bits.
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    /// Offset of executable segment.
    pub exec_seg_base: Option<u64>,
    /// Limit of executable segment.
    pub exec_seg_limit: Option<u64>,
    /// Executable segment flags.
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pre_encrypt: Option<RegionOffset>,
    // Version 0x20600
    pub linkage_hash_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub spare4: Option<u16>,
    linkage: Option<RegionOffset>,
    pub linkage_size: Option<u32>,

    // End of blob header data / start of derived data.
    ident: String,
    team_id: Option<String>,
    /// Index 0 holds the highest numbered special slot.
    special_hashes: Vec<Digest>,
    code_hashes: Vec<Digest>,
    layout: Vec<Segment>,
}

impl Blob for CodeDirectoryBlob {
    fn magic(&self) -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let (magic, length) = read_blob_header(data)?;
        if magic != u32::from(CodeSigningMagic::CodeDirectory) {
            return Err(ResignError::BadMagic("code directory blob"));
        }

        // All offsets are relative to the start of the blob, header included.
        let data = &data[0..length];

        if data.len() < CodeDirectoryVersion::header_size(0) {
            return Err(ResignError::MalformedStructure("code directory header truncated"));
        }

        let mut offset = 8;
        let version = data.gread_with(&mut offset, scroll::BE)?;

        if data.len() < CodeDirectoryVersion::header_size(version) {
            return Err(ResignError::MalformedStructure(
                "code directory header truncated for its version",
            ));
        }

        let flags = data.gread_with::<u32>(&mut offset, scroll::BE)?;
        let flags = unsafe { CodeSignatureFlags::from_bits_unchecked(flags) };
        let hash_offset = data.gread_with::<u32>(&mut offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(&mut offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(&mut offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(&mut offset, scroll::BE)?;
        let code_limit = data.gread_with(&mut offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(&mut offset, scroll::BE)?;
        let hash_type = data.gread_with::<u8>(&mut offset, scroll::BE)?.into();
        let platform = data.gread_with(&mut offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(&mut offset, scroll::BE)?;
        let page_size = 2u32
            .checked_pow(page_size as u32)
            .ok_or(ResignError::MalformedStructure("code directory page size"))?;
        let spare2 = data.gread_with(&mut offset, scroll::BE)?;

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            data.gread_with::<u32>(&mut offset, scroll::BE)?
        } else {
            0
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            let v = data.gread_with::<u32>(&mut offset, scroll::BE)?;

            if v != 0 {
                Some(v)
            } else {
                None
            }
        } else {
            None
        };

        let (spare3, code_limit_64) = if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32
        {
            (
                Some(data.gread_with(&mut offset, scroll::BE)?),
                Some(data.gread_with(&mut offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
                (
                    Some(data.gread_with(&mut offset, scroll::BE)?),
                    Some(data.gread_with(&mut offset, scroll::BE)?),
                    Some(data.gread_with::<u64>(&mut offset, scroll::BE)?),
                )
            } else {
                (None, None, None)
            };

        let exec_seg_flags = exec_seg_flags
            .map(|flags| unsafe { ExecutableSegmentFlags::from_bits_unchecked(flags) });

        let (runtime, pre_encrypt_offset) =
            if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                (
                    Some(data.gread_with(&mut offset, scroll::BE)?),
                    data.gread_with::<u32>(&mut offset, scroll::BE)?,
                )
            } else {
                (None, 0)
            };

        let (linkage_hash_type, linkage_truncated, spare4, linkage_offset, linkage_size) =
            if version >= CodeDirectoryVersion::SupportsLinkage as u32 {
                (
                    Some(data.gread_with(&mut offset, scroll::BE)?),
                    Some(data.gread_with(&mut offset, scroll::BE)?),
                    Some(data.gread_with(&mut offset, scroll::BE)?),
                    data.gread_with::<u32>(&mut offset, scroll::BE)?,
                    Some(data.gread_with(&mut offset, scroll::BE)?),
                )
            } else {
                (None, None, None, 0, None)
            };

        let header_end = offset;

        let (ident, ident_end) = read_c_string(data, ident_offset as usize)
            .ok_or(ResignError::CodeDirectoryMalformedIdentifier)?;

        let team = if let Some(team_offset) = team_offset {
            let (team, team_end) = read_c_string(data, team_offset as usize)
                .ok_or(ResignError::CodeDirectoryMalformedTeam)?;

            Some((team, team_offset as usize, team_end))
        } else {
            None
        };

        // Special digests sit at "negative" indices before hash_offset.
        let hash_size_usize = hash_size as usize;
        let specials_len = (n_special_slots as usize)
            .checked_mul(hash_size_usize)
            .ok_or(ResignError::MalformedStructure("special slot count"))?;
        let codes_len = (n_code_slots as usize)
            .checked_mul(hash_size_usize)
            .ok_or(ResignError::MalformedStructure("code slot count"))?;
        let hashes_start = (hash_offset as usize).checked_sub(specials_len).ok_or(
            ResignError::MalformedStructure("special slot digests precede code directory"),
        )?;
        let hashes_end = (hash_offset as usize)
            .checked_add(codes_len)
            .filter(|end| *end <= data.len())
            .ok_or(ResignError::MalformedStructure(
                "code slot digests exceed code directory length",
            ))?;

        let special_hashes = get_hashes(
            data,
            hashes_start,
            n_special_slots as usize,
            hash_size_usize,
        );
        let code_hashes = get_hashes(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            hash_size_usize,
        );

        let mut regions = vec![
            (ident_offset as usize, ident_end, Segment::Identifier),
            (hashes_start, hashes_end, Segment::Hashes),
        ];
        let team_id = if let Some((team, start, end)) = team {
            regions.push((start, end, Segment::TeamId));
            Some(team)
        } else {
            None
        };
        regions.sort_by_key(|(start, end, _)| (*start, *end));

        let mut layout = vec![];
        let mut raw_regions = vec![];
        let mut position = header_end;

        for (start, end, segment) in regions {
            if start < position {
                return Err(ResignError::MalformedStructure(
                    "overlapping code directory regions",
                ));
            }
            if start > position {
                raw_regions.push(position..start);
                layout.push(Segment::Raw(data[position..start].to_vec()));
            }

            layout.push(segment);
            position = end;
        }

        if position < data.len() {
            raw_regions.push(position..data.len());
            layout.push(Segment::Raw(data[position..].to_vec()));
        }

        let anchor = |offset: u32| -> Result<Option<RegionOffset>, ResignError> {
            let value = offset as usize;

            if offset == 0 {
                Ok(None)
            } else if value < header_end {
                Ok(Some(RegionOffset::Fixed(offset)))
            } else {
                raw_regions
                    .iter()
                    .position(|region| region.start <= value && value <= region.end)
                    .map(|ordinal| {
                        Some(RegionOffset::Raw {
                            ordinal,
                            delta: value - raw_regions[ordinal].start,
                        })
                    })
                    .ok_or(ResignError::MalformedStructure(
                        "code directory offset points into a known region",
                    ))
            }
        };

        let scatter = anchor(scatter_offset)?;
        let pre_encrypt = anchor(pre_encrypt_offset)?;
        let linkage = anchor(linkage_offset)?;

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt,
            linkage_hash_type,
            linkage_truncated,
            spare4,
            linkage,
            linkage_size,
            ident,
            team_id,
            special_hashes,
            code_hashes,
            layout,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError> {
        if self
            .special_hashes
            .iter()
            .chain(self.code_hashes.iter())
            .any(|digest| digest.data.len() != self.hash_size as usize)
        {
            return Err(ResignError::MalformedStructure(
                "digest length differs from code directory hash size",
            ));
        }

        let raw_offsets = self.raw_offsets();
        let resolve = |reference: Option<RegionOffset>| -> Result<u32, ResignError> {
            let offset = match reference {
                None => 0,
                Some(RegionOffset::Fixed(offset)) => offset as usize,
                Some(RegionOffset::Raw { ordinal, delta }) => {
                    raw_offsets
                        .get(ordinal)
                        .ok_or(ResignError::MalformedStructure(
                            "code directory offset refers to a missing region",
                        ))?
                        + delta
                }
            };

            Ok(offset as u32)
        };

        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // We need to do this in 2 phases because we don't know the offsets until
        // we write out the variable area.

        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits(), scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        cursor.iowrite_with(self.special_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let mut team_offset_cursor_position = None;

        if self.version >= CodeDirectoryVersion::SupportsScatter as u32 {
            cursor.iowrite_with(resolve(self.scatter)?, scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            team_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags
                    .unwrap_or_else(ExecutableSegmentFlags::empty)
                    .bits(),
                scroll::BE,
            )?;
        }
        if self.version >= CodeDirectoryVersion::SupportsRuntime as u32 {
            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(resolve(self.pre_encrypt)?, scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsLinkage as u32 {
            cursor.iowrite_with(self.linkage_hash_type.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_truncated.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.spare4.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(resolve(self.linkage)?, scroll::BE)?;
            cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
        }

        // We've written all the struct fields. Now write variable length fields
        // in the order they were laid out.

        let mut identity_offset = 0;
        let mut team_offset = None;
        let mut code_hashes_start_offset = 0;

        for segment in &self.layout {
            match segment {
                Segment::Identifier => {
                    identity_offset = cursor.position();
                    cursor.write_all(self.ident.as_bytes())?;
                    cursor.write_all(b"\0")?;
                }
                Segment::TeamId => {
                    if let Some(team_id) = &self.team_id {
                        team_offset = Some(cursor.position());
                        cursor.write_all(team_id.as_bytes())?;
                        cursor.write_all(b"\0")?;
                    }
                }
                Segment::Hashes => {
                    for hash in &self.special_hashes {
                        cursor.write_all(&hash.data)?;
                    }

                    code_hashes_start_offset = cursor.position();

                    for hash in &self.code_hashes {
                        cursor.write_all(&hash.data)?;
                    }
                }
                Segment::Raw(data) => {
                    cursor.write_all(data)?;
                }
            }
        }

        // Now go back and update the placeholder offsets. We need to add 8 to account
        // for the blob header, which isn't present in this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(code_hashes_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if let (Some(position), Some(offset)) = (team_offset_cursor_position, team_offset) {
            cursor.set_position(position);
            cursor.iowrite_with(offset as u32 + 8, scroll::BE)?;
        }

        Ok(cursor.into_inner())
    }
}

impl CodeDirectoryBlob {
    /// Construct a new code directory.
    ///
    /// `special_slots` null digests are reserved for special slots. The variable
    /// area holds the identifier followed by the digests.
    pub fn new(
        version: u32,
        hash_type: DigestType,
        ident: &str,
        special_slots: usize,
        code_hashes: Vec<Digest>,
    ) -> Result<Self, ResignError> {
        let hash_len = hash_type.hash_len()?;

        let mut cd = Self {
            version,
            flags: CodeSignatureFlags::empty(),
            code_limit: 0,
            hash_size: hash_len as u8,
            hash_type,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            runtime: None,
            pre_encrypt: None,
            linkage_hash_type: None,
            linkage_truncated: None,
            spare4: None,
            linkage: None,
            linkage_size: None,
            ident: String::new(),
            team_id: None,
            special_hashes: vec![Digest::null(hash_len); special_slots],
            code_hashes,
            layout: vec![Segment::Identifier, Segment::Hashes],
        };
        cd.set_identifier(ident)?;

        Ok(cd)
    }

    /// The identifier string, usually the bundle identifier.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Replace the identifier string.
    ///
    /// Regions laid out after the identifier move by the change in length, as
    /// does the declared length of the blob.
    pub fn set_identifier(&mut self, ident: &str) -> Result<(), ResignError> {
        if ident.contains('\0') {
            return Err(ResignError::CodeDirectoryMalformedIdentifier);
        }

        self.ident = ident.to_string();

        Ok(())
    }

    /// The team identifier, if one is recorded.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// Record a team identifier.
    ///
    /// Code directories older than [CodeDirectoryVersion::SupportsTeamId] have no
    /// field for it; a warning is logged and `false` returned. A team identifier
    /// added to a directory that had none is placed directly after the identifier.
    pub fn set_team_id(&mut self, team_id: &str) -> Result<bool, ResignError> {
        if self.version < CodeDirectoryVersion::SupportsTeamId as u32 {
            warn!(
                "code directory version {:#x} for {} cannot record team identifier {}",
                self.version, self.ident, team_id
            );
            return Ok(false);
        }

        if team_id.contains('\0') {
            return Err(ResignError::CodeDirectoryMalformedTeam);
        }

        if !self.layout.contains(&Segment::TeamId) {
            let position = self
                .layout
                .iter()
                .position(|segment| segment == &Segment::Identifier)
                .map(|i| i + 1)
                .unwrap_or(self.layout.len());
            self.layout.insert(position, Segment::TeamId);
        }

        self.team_id = Some(team_id.to_string());

        Ok(true)
    }

    /// Number of special slot digests (`nSpecialSlots`).
    pub fn n_special_slots(&self) -> u32 {
        self.special_hashes.len() as u32
    }

    /// Obtain the digest recorded for a special slot, if the slot is present.
    pub fn special_hash(&self, slot: SpecialSlot) -> Option<&Digest> {
        slot.index(self.n_special_slots())
            .and_then(|index| self.special_hashes.get(index))
    }

    /// Replace the digest of a present special slot.
    ///
    /// The slot array never grows, so absent slots can't be set.
    pub fn set_special_hash(&mut self, slot: SpecialSlot, digest: Digest) -> Result<(), ResignError> {
        if digest.data.len() != self.hash_size as usize {
            return Err(ResignError::DigestLengthMismatch(
                slot,
                digest.data.len(),
                self.hash_size as usize,
            ));
        }

        let index = slot
            .index(self.n_special_slots())
            .ok_or(ResignError::MalformedStructure(
                "special slot not present in code directory",
            ))?;

        self.special_hashes[index] = digest;

        Ok(())
    }

    /// Digests of code pages.
    pub fn code_hashes(&self) -> &[Digest] {
        &self.code_hashes
    }

    fn segment_len(&self, segment: &Segment) -> usize {
        match segment {
            Segment::Identifier => self.ident.len() + 1,
            Segment::TeamId => self.team_id.as_ref().map(|t| t.len() + 1).unwrap_or(0),
            Segment::Hashes => {
                (self.special_hashes.len() + self.code_hashes.len()) * self.hash_size as usize
            }
            Segment::Raw(data) => data.len(),
        }
    }

    /// Absolute offset of a segment within the encoded blob.
    fn segment_offset(&self, wanted: &Segment) -> Option<usize> {
        let mut position = CodeDirectoryVersion::header_size(self.version);

        for segment in &self.layout {
            if segment == wanted {
                return Some(position);
            }
            position += self.segment_len(segment);
        }

        None
    }

    /// Absolute offsets of each [Segment::Raw], in layout order.
    fn raw_offsets(&self) -> Vec<usize> {
        let mut position = CodeDirectoryVersion::header_size(self.version);
        let mut offsets = vec![];

        for segment in &self.layout {
            if matches!(segment, Segment::Raw(_)) {
                offsets.push(position);
            }
            position += self.segment_len(segment);
        }

        offsets
    }

    fn region_offset(&self, reference: Option<RegionOffset>) -> Option<usize> {
        match reference? {
            RegionOffset::Fixed(offset) => Some(offset as usize),
            RegionOffset::Raw { ordinal, delta } => {
                self.raw_offsets().get(ordinal).map(|start| start + delta)
            }
        }
    }

    /// Offset of the scatter vector (`scatterOffset`), if there is one.
    pub fn scatter_offset(&self) -> Option<usize> {
        self.region_offset(self.scatter)
    }

    /// Offset of the pre-encryption hash table (`preEncryptOffset`), if there is one.
    pub fn pre_encrypt_offset(&self) -> Option<usize> {
        self.region_offset(self.pre_encrypt)
    }

    /// Offset of the linkage data (`linkageOffset`), if there is one.
    pub fn linkage_offset(&self) -> Option<usize> {
        self.region_offset(self.linkage)
    }

    /// Offset of the identifier string (`identOffset`).
    pub fn ident_offset(&self) -> usize {
        self.segment_offset(&Segment::Identifier).unwrap_or(0)
    }

    /// Offset of code slot 0 (`hashOffset`).
    pub fn hash_offset(&self) -> usize {
        self.segment_offset(&Segment::Hashes)
            .map(|offset| offset + self.special_hashes.len() * self.hash_size as usize)
            .unwrap_or(0)
    }

    /// Offset of the team identifier string, if one is recorded.
    pub fn team_offset(&self) -> Option<usize> {
        if self.team_id.is_some() {
            self.segment_offset(&Segment::TeamId)
        } else {
            None
        }
    }

    /// Length of the encoded blob, header included.
    pub fn length(&self) -> usize {
        CodeDirectoryVersion::header_size(self.version)
            + self
                .layout
                .iter()
                .map(|segment| self.segment_len(segment))
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A version 0x20200 directory with padding between its regions.
    fn padded_fixture() -> Vec<u8> {
        let mut data = Vec::new();
        for v in [0xfade0c02u32, 100, 0x20200, 0, 0x50, 0x34, 1, 1, 0x1000] {
            data.extend(v.to_be_bytes());
        }
        data.extend([20u8, 1, 0, 12]);
        for v in [0u32, 0, 0x38] {
            data.extend(v.to_be_bytes());
        }
        assert_eq!(data.len(), 0x34);
        data.extend(b"a\0\xee\xeeT\0\xee\xee");
        data.extend([0x11; 20]);
        data.extend([0x22; 20]);
        assert_eq!(data.len(), 100);

        data
    }

    #[test]
    fn header_sizes() {
        assert_eq!(CodeDirectoryVersion::header_size(0x20001), 0x2c);
        assert_eq!(CodeDirectoryVersion::header_size(0x20100), 0x30);
        assert_eq!(CodeDirectoryVersion::header_size(0x20200), 0x34);
        assert_eq!(CodeDirectoryVersion::header_size(0x20300), 0x40);
        assert_eq!(CodeDirectoryVersion::header_size(0x20400), 0x58);
        assert_eq!(CodeDirectoryVersion::header_size(0x20500), 0x60);
        assert_eq!(CodeDirectoryVersion::header_size(0x20600), 0x6c);
    }

    #[test]
    fn parse_padded() {
        let source = padded_fixture();

        let cd = CodeDirectoryBlob::from_blob_bytes(&source).unwrap();
        assert_eq!(cd.ident(), "a");
        assert_eq!(cd.team_id(), Some("T"));
        assert_eq!(cd.hash_type, DigestType::Sha1);
        assert_eq!(cd.page_size, 4096);
        assert_eq!(cd.n_special_slots(), 1);
        assert_eq!(
            cd.special_hash(SpecialSlot::Info).unwrap().data,
            vec![0x11; 20]
        );
        assert!(cd.special_hash(SpecialSlot::Requirements).is_none());
        assert_eq!(cd.code_hashes()[0].data, vec![0x22; 20]);
        assert_eq!(cd.ident_offset(), 0x34);
        assert_eq!(cd.team_offset(), Some(0x38));
        assert_eq!(cd.hash_offset(), 0x50);
        assert_eq!(cd.length(), 100);

        assert_eq!(cd.to_blob_bytes().unwrap(), source);
    }

    #[test]
    fn identifier_change_shifts_following_regions() {
        let mut cd = CodeDirectoryBlob::from_blob_bytes(&padded_fixture()).unwrap();

        cd.set_identifier("abc").unwrap();

        let data = cd.to_blob_bytes().unwrap();
        assert_eq!(data.len(), 102);
        assert_eq!(data.pread_with::<u32>(4, scroll::BE).unwrap(), 102);
        assert_eq!(data.pread_with::<u32>(0x10, scroll::BE).unwrap(), 0x52);
        assert_eq!(data.pread_with::<u32>(0x14, scroll::BE).unwrap(), 0x34);
        assert_eq!(data.pread_with::<u32>(0x30, scroll::BE).unwrap(), 0x3a);
        assert_eq!(&data[0x34..0x3c], b"abc\0\xee\xeeT\0");

        let reparsed = CodeDirectoryBlob::from_blob_bytes(&data).unwrap();
        assert_eq!(reparsed, cd);
    }

    #[test]
    fn truncated_header() {
        // Declared length covers the count fields but not the full header.
        let mut source = padded_fixture();
        source[4..8].copy_from_slice(&20u32.to_be_bytes());
        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&source),
            Err(ResignError::MalformedStructure(_))
        ));

        // Long enough for a version 0x20000 header, not for 0x20600.
        let mut source = padded_fixture();
        source[8..12].copy_from_slice(&0x20600u32.to_be_bytes());
        source[4..8].copy_from_slice(&0x60u32.to_be_bytes());
        source.truncate(0x60);
        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&source),
            Err(ResignError::MalformedStructure(_))
        ));
    }

    #[test]
    fn scatter_offset_follows_its_region() {
        let mut source = padded_fixture();
        source[0x2c..0x30].copy_from_slice(&0x3au32.to_be_bytes());

        let mut cd = CodeDirectoryBlob::from_blob_bytes(&source).unwrap();
        assert_eq!(cd.scatter_offset(), Some(0x3a));
        assert_eq!(cd.to_blob_bytes().unwrap(), source);

        cd.set_identifier("abc").unwrap();
        assert_eq!(cd.scatter_offset(), Some(0x3c));

        let data = cd.to_blob_bytes().unwrap();
        assert_eq!(data.pread_with::<u32>(0x2c, scroll::BE).unwrap(), 0x3c);
        assert_eq!(&data[0x3c..0x3e], b"\xee\xee");
        assert_eq!(CodeDirectoryBlob::from_blob_bytes(&data).unwrap(), cd);
    }

    #[test]
    fn scatter_offset_into_identifier_rejected() {
        let mut source = padded_fixture();
        source[0x2c..0x30].copy_from_slice(&0x34u32.to_be_bytes());

        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&source),
            Err(ResignError::MalformedStructure(_))
        ));
    }

    #[test]
    fn team_id_added_after_identifier() {
        let mut cd = CodeDirectoryBlob::new(
            CodeDirectoryVersion::SupportsExecutableSegment as u32,
            DigestType::Sha256,
            "com.example.app",
            2,
            vec![Digest::from(vec![0x33; 32])],
        )
        .unwrap();
        assert_eq!(cd.team_offset(), None);
        let hash_offset = cd.hash_offset();

        assert!(cd.set_team_id("TEAM1").unwrap());
        assert_eq!(cd.team_offset(), Some(0x58 + 16));
        assert_eq!(cd.hash_offset(), hash_offset + 6);

        let data = cd.to_blob_bytes().unwrap();
        assert_eq!(data.len(), cd.length());
        assert_eq!(data.pread_with::<u32>(0x30, scroll::BE).unwrap(), 0x58 + 16);
        assert_eq!(
            CodeDirectoryBlob::from_blob_bytes(&data).unwrap().team_id(),
            Some("TEAM1")
        );
    }

    #[test]
    fn team_id_unrecordable_before_version() {
        let mut cd = CodeDirectoryBlob::new(
            CodeDirectoryVersion::SupportsScatter as u32,
            DigestType::Sha1,
            "com.example.app",
            0,
            vec![],
        )
        .unwrap();
        let before = cd.to_blob_bytes().unwrap();

        assert!(!cd.set_team_id("TEAM1").unwrap());
        assert_eq!(cd.team_id(), None);
        assert_eq!(cd.to_blob_bytes().unwrap(), before);
    }

    #[test]
    fn special_hash_length_checked() {
        let mut cd =
            CodeDirectoryBlob::new(0x20400, DigestType::Sha256, "id", 5, vec![]).unwrap();

        assert!(matches!(
            cd.set_special_hash(SpecialSlot::Entitlements, Digest::from(vec![0; 20])),
            Err(ResignError::DigestLengthMismatch(
                SpecialSlot::Entitlements,
                20,
                32
            ))
        ));

        cd.set_special_hash(SpecialSlot::Entitlements, Digest::from(vec![0x44; 32]))
            .unwrap();
        let data = cd.to_blob_bytes().unwrap();
        // Entitlements is slot 5, the lowest address of the special digests.
        let start = 0x58 + 3;
        assert_eq!(&data[start..start + 32], &[0x44; 32]);
    }

    #[test]
    fn overlapping_regions_rejected() {
        let mut source = padded_fixture();
        // Point the team identifier into the identifier string.
        source[0x30..0x34].copy_from_slice(&0x35u32.to_be_bytes());
        source[0x35] = b'b';
        source[0x36] = 0;

        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&source),
            Err(ResignError::MalformedStructure(_))
        ));
    }

    #[test]
    fn digests_beyond_length_rejected() {
        let mut source = padded_fixture();
        source[0x10..0x14].copy_from_slice(&0x60u32.to_be_bytes());

        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&source),
            Err(ResignError::MalformedStructure(_))
        ));
    }

    #[test]
    fn unterminated_identifier() {
        let mut source = padded_fixture();
        source[0x14..0x18].copy_from_slice(&0x63u32.to_be_bytes());
        source[0x63] = b'x';

        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&source),
            Err(ResignError::CodeDirectoryMalformedIdentifier)
        ));
    }
}
