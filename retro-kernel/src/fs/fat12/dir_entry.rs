//! On-disk 32-byte directory entries and 8.3 name handling.

use super::Cluster;
use bitflags::bitflags;
use core::fmt;

pub const ENTRY_SIZE: usize = 32;
pub const ENTRIES_PER_SECTOR: usize = super::SECTOR_SIZE / ENTRY_SIZE;

/// First-byte markers.
pub const MARKER_END: u8 = 0x00;
pub const MARKER_DELETED: u8 = 0xe5;

/// Placeholder timestamps: 1980-01-01, midnight. No RTC driver is in scope.
pub const EPOCH_DATE: u16 = 0x0021;
pub const EPOCH_TIME: u16 = 0x0000;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// The long-filename marker is a combination, not a flag.
pub const ATTR_LFN: u8 = 0x0f;

/// What a raw 32-byte slot holds.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SlotKind {
    /// First byte 0: no entry here or after.
    End,
    /// First byte 0xE5.
    Deleted,
    /// Attribute 0x0F: long-filename fragment, skipped on FAT12.
    LongName,
    /// Attribute 0x08: the volume label, not a file.
    VolumeLabel,
    Live,
}

/// Deserialized directory entry. `cluster_high` is always 0 on FAT12 and is
/// written back as such.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attr: Attributes,
    pub cluster: u16,
    pub file_size: u32,
}

impl DirEntry {
    pub fn classify(raw: &[u8; ENTRY_SIZE]) -> SlotKind {
        match (raw[0], raw[11]) {
            (MARKER_END, _) => SlotKind::End,
            (MARKER_DELETED, _) => SlotKind::Deleted,
            (_, attr) if attr == ATTR_LFN => SlotKind::LongName,
            (_, attr) if attr & Attributes::VOLUME_ID.bits() != 0 => SlotKind::VolumeLabel,
            _ => SlotKind::Live,
        }
    }

    pub fn from_raw(raw: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            name: raw[0..11].try_into().unwrap(),
            attr: Attributes::from_bits_truncate(raw[11]),
            cluster: u16::from_le_bytes([raw[26], raw[27]]),
            file_size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    pub fn to_raw(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..11].copy_from_slice(&self.name);
        raw[11] = self.attr.bits();
        raw[14..16].copy_from_slice(&EPOCH_TIME.to_le_bytes()); // creation
        raw[16..18].copy_from_slice(&EPOCH_DATE.to_le_bytes());
        raw[18..20].copy_from_slice(&EPOCH_DATE.to_le_bytes()); // access
        raw[20..22].copy_from_slice(&0u16.to_le_bytes()); // cluster high
        raw[22..24].copy_from_slice(&EPOCH_TIME.to_le_bytes()); // write
        raw[24..26].copy_from_slice(&EPOCH_DATE.to_le_bytes());
        raw[26..28].copy_from_slice(&self.cluster.to_le_bytes());
        raw[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        raw
    }

    pub fn is_directory(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }

    pub fn start_cluster(&self) -> Option<Cluster> {
        (self.cluster != 0).then(|| Cluster(self.cluster))
    }

    /// New plain file entry (attribute ARCHIVE, no data yet).
    pub fn new_file(name: [u8; 11]) -> Self {
        Self {
            name,
            attr: Attributes::ARCHIVE,
            cluster: 0,
            file_size: 0,
        }
    }

    pub fn new_directory(name: [u8; 11], cluster: Cluster) -> Self {
        Self {
            name,
            attr: Attributes::DIRECTORY,
            cluster: cluster.0,
            file_size: 0,
        }
    }

    pub fn new_volume_label(label: [u8; 11]) -> Self {
        Self {
            name: label,
            attr: Attributes::VOLUME_ID,
            cluster: 0,
            file_size: 0,
        }
    }
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", decode_83(&self.name).as_str())
    }
}

/// Errors turning a filename into the on-disk 8.3 form.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum NameError {
    Empty,
    TooLong,
    BadCharacter,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameError::Empty => write!(f, "empty name"),
            NameError::TooLong => write!(f, "name does not fit 8.3"),
            NameError::BadCharacter => write!(f, "invalid character in name"),
        }
    }
}

fn valid_83_byte(b: u8) -> bool {
    matches!(b,
        b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'-' | b'@'
        | b'^' | b'_' | b'`' | b'{' | b'}' | b'~')
}

/// Encode `name` as the space-padded, uppercased 11-byte form. Stops the base
/// name at the first dot; everything after it becomes the extension.
pub fn encode_83(name: &str) -> Result<[u8; 11], NameError> {
    if name.is_empty() || name == "." || name == ".." {
        // Dot entries are written directly by mkdir, never through here.
        Err(NameError::Empty)?;
    }
    let mut out = [b' '; 11];
    let mut bytes = name.bytes();
    let mut i = 0;
    let mut seen_dot = false;
    for b in &mut bytes {
        if b == b'.' {
            seen_dot = true;
            break;
        }
        if i == 8 {
            Err(NameError::TooLong)?;
        }
        let b = b.to_ascii_uppercase();
        if !valid_83_byte(b) {
            Err(NameError::BadCharacter)?;
        }
        out[i] = b;
        i += 1;
    }
    if i == 0 {
        Err(NameError::Empty)?;
    }
    if seen_dot {
        let mut j = 0;
        for b in bytes {
            if j == 3 {
                Err(NameError::TooLong)?;
            }
            let b = b.to_ascii_uppercase();
            if !valid_83_byte(b) {
                Err(NameError::BadCharacter)?;
            }
            out[8 + j] = b;
            j += 1;
        }
    }
    Ok(out)
}

/// Volume labels are a plain 11-byte field: uppercased, space-padded,
/// silently truncated.
pub fn encode_label(label: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    for (slot, b) in out.iter_mut().zip(label.bytes()) {
        *slot = b.to_ascii_uppercase();
    }
    out
}

/// Inverse of [`encode_83`]: trim both fields, join with a dot when the
/// extension is non-empty.
pub fn decode_83(name: &[u8; 11]) -> heapless::String<12> {
    let mut out: heapless::String<12> = heapless::String::new();
    for b in name[0..8].iter().take_while(|b| **b != b' ') {
        let _ = out.push(*b as char);
    }
    if name[8] != b' ' {
        let _ = out.push('.');
        for b in name[8..11].iter().take_while(|b| **b != b' ') {
            let _ = out.push(*b as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_pads_and_uppercases() {
        assert_eq!(encode_83("foo.txt").unwrap(), *b"FOO     TXT");
        assert_eq!(encode_83("KERNEL32").unwrap(), *b"KERNEL32   ");
        assert_eq!(encode_83("a.b").unwrap(), *b"A       B  ");
        assert_eq!(encode_83("noext").unwrap(), *b"NOEXT      ");
    }

    #[test]
    fn encode_rejects_bad_names() {
        assert_eq!(encode_83(""), Err(NameError::Empty));
        assert_eq!(encode_83(".hidden"), Err(NameError::Empty));
        assert_eq!(encode_83("longbasename.txt"), Err(NameError::TooLong));
        assert_eq!(encode_83("a.text"), Err(NameError::TooLong));
        assert_eq!(encode_83("sp ace.txt"), Err(NameError::BadCharacter));
        assert_eq!(encode_83("a+b"), Err(NameError::BadCharacter));
    }

    #[test]
    fn decode_inverts_encode() {
        for name in ["FOO.TXT", "KERNEL32", "A.B", "NOEXT"] {
            let encoded = encode_83(name).unwrap();
            assert_eq!(decode_83(&encoded).as_str(), name);
        }
    }

    #[test]
    fn comparison_is_raw_byte_equality() {
        assert_eq!(encode_83("foo.txt").unwrap(), encode_83("FOO.TXT").unwrap());
        assert_ne!(encode_83("foo.txt").unwrap(), encode_83("foo.txs").unwrap());
    }

    #[test]
    fn classify_first_byte_and_attributes() {
        let mut raw = [0u8; ENTRY_SIZE];
        assert_eq!(DirEntry::classify(&raw), SlotKind::End);
        raw[0] = MARKER_DELETED;
        assert_eq!(DirEntry::classify(&raw), SlotKind::Deleted);
        raw[0] = b'A';
        raw[11] = ATTR_LFN;
        assert_eq!(DirEntry::classify(&raw), SlotKind::LongName);
        raw[11] = Attributes::VOLUME_ID.bits();
        assert_eq!(DirEntry::classify(&raw), SlotKind::VolumeLabel);
        raw[11] = Attributes::ARCHIVE.bits();
        assert_eq!(DirEntry::classify(&raw), SlotKind::Live);
    }

    #[test]
    fn raw_round_trip_keeps_cluster_and_size() {
        let entry = DirEntry {
            name: *b"FOO     TXT",
            attr: Attributes::ARCHIVE,
            cluster: 0x123,
            file_size: 1234,
        };
        let raw = entry.to_raw();
        assert_eq!(u16::from_le_bytes([raw[20], raw[21]]), 0); // high half
        assert_eq!(DirEntry::from_raw(&raw), entry);
    }

    #[test]
    fn placeholder_timestamps_are_epoch_1980() {
        let raw = DirEntry::new_file(*b"X          ").to_raw();
        assert_eq!(u16::from_le_bytes([raw[16], raw[17]]), EPOCH_DATE);
        assert_eq!(u16::from_le_bytes([raw[14], raw[15]]), EPOCH_TIME);
    }
}
