//! FAT12 boot sector (BPB) parsing and construction.

use super::{Cluster, SliceExt, MAX_CLUSTERS, SECTOR_SIZE};
use core::fmt;

/// Error while reading a boot sector.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Error {
    SignatureMismatch,
    Broken(&'static str),
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SignatureMismatch => write!(f, "boot signature mismatch"),
            Error::Broken(s) => write!(f, "broken boot sector: {}", s),
            Error::Unsupported(s) => write!(f, "unsupported: {}", s),
        }
    }
}

/// Deserialized boot sector structure.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct BootSector {
    /// Sector size in bytes. This driver requires 512.
    bpb_byts_per_sec: u16,
    /// Cluster size in sectors, a power of two.
    bpb_sec_per_clus: u8,
    /// Reserved area size in sectors, including this boot sector.
    bpb_rsvd_sec_cnt: u16,
    /// Number of FAT copies, conventionally 2.
    bpb_num_fats: u8,
    /// Number of 32-byte entries in the root directory.
    bpb_root_ent_cnt: u16,
    /// Total sectors when they fit 16 bits; otherwise 0 and the 32-bit field
    /// is authoritative.
    bpb_tot_sec_16: u16,
    /// Media descriptor, echoed in FAT[0].
    bpb_media: u8,
    /// FAT size in sectors.
    bpb_fat_sz_16: u16,
    bpb_sec_per_trk: u16,
    bpb_num_heads: u16,
    bpb_hidd_sec: u32,
    bpb_tot_sec_32: u32,
    vol_id: u32,
    vol_lab: [u8; 11],
}

impl BootSector {
    pub fn sector_size(&self) -> usize {
        self.bpb_byts_per_sec as usize
    }

    pub fn cluster_size_sectors(&self) -> usize {
        self.bpb_sec_per_clus as usize
    }

    pub fn cluster_size_bytes(&self) -> usize {
        self.cluster_size_sectors() * self.sector_size()
    }

    pub fn fat_count(&self) -> usize {
        self.bpb_num_fats as usize
    }

    pub fn fat_size(&self) -> usize {
        self.bpb_fat_sz_16 as usize
    }

    pub fn root_entry_count(&self) -> usize {
        self.bpb_root_ent_cnt as usize
    }

    pub fn media(&self) -> u8 {
        self.bpb_media
    }

    pub fn volume_id(&self) -> u32 {
        self.vol_id
    }

    pub fn volume_label(&self) -> [u8; 11] {
        self.vol_lab
    }

    pub fn total_sectors(&self) -> usize {
        if self.bpb_tot_sec_16 != 0 {
            self.bpb_tot_sec_16 as usize
        } else {
            self.bpb_tot_sec_32 as usize
        }
    }

    // A FAT12 volume is laid out as
    // reserved area | FAT area | root directory | data area

    pub fn fat_start(&self) -> usize {
        self.bpb_rsvd_sec_cnt as usize
    }

    pub fn root_start(&self) -> usize {
        self.fat_start() + self.fat_count() * self.fat_size()
    }

    pub fn root_sectors(&self) -> usize {
        (self.root_entry_count() * 32 + SECTOR_SIZE - 1) / SECTOR_SIZE
    }

    pub fn data_start(&self) -> usize {
        self.root_start() + self.root_sectors()
    }

    pub fn total_clusters(&self) -> usize {
        (self.total_sectors() - self.data_start()) / self.cluster_size_sectors()
    }

    /// Clusters 2..2+total are mapped onto the data area in order.
    pub fn cluster_to_lba(&self, cluster: Cluster) -> usize {
        self.data_start() + (cluster.index() - 2) * self.cluster_size_sectors()
    }

    pub fn is_cluster_in_range(&self, cluster: Cluster) -> bool {
        2 <= cluster.index() && cluster.index() < 2 + self.total_clusters()
    }

    /// Serialize for `format`: jump+NOP, OEM name, BPB, 0xAA55 signature.
    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0..3].copy_from_slice(&[0xeb, 0x3c, 0x90]);
        buf[3..11].copy_from_slice(b"RETROFUT");
        buf.copy_from_array(11, self.bpb_byts_per_sec.to_le_bytes());
        buf[13] = self.bpb_sec_per_clus;
        buf.copy_from_array(14, self.bpb_rsvd_sec_cnt.to_le_bytes());
        buf[16] = self.bpb_num_fats;
        buf.copy_from_array(17, self.bpb_root_ent_cnt.to_le_bytes());
        buf.copy_from_array(19, self.bpb_tot_sec_16.to_le_bytes());
        buf[21] = self.bpb_media;
        buf.copy_from_array(22, self.bpb_fat_sz_16.to_le_bytes());
        buf.copy_from_array(24, self.bpb_sec_per_trk.to_le_bytes());
        buf.copy_from_array(26, self.bpb_num_heads.to_le_bytes());
        buf.copy_from_array(28, self.bpb_hidd_sec.to_le_bytes());
        buf.copy_from_array(32, self.bpb_tot_sec_32.to_le_bytes());
        buf[36] = 0x00; // drive number, filled by the BIOS on boot
        buf[38] = 0x29; // extended boot signature
        buf.copy_from_array(39, self.vol_id.to_le_bytes());
        buf.copy_from_array(43, self.vol_lab);
        buf.copy_from_array(54, *b"FAT12   ");
        buf[510] = 0x55;
        buf[511] = 0xaa;
        buf
    }

    /// Pick geometry for a fresh volume of `total_sectors`.
    ///
    /// The thresholds follow DOS practice: a 1.44M floppy gets one sector per
    /// cluster and 224 root entries; small hard-disk images scale
    /// sectors-per-cluster up, doubling further whenever the cluster count
    /// would overflow what FAT12 can index.
    pub fn for_format(total_sectors: usize, volume_id: u32, label: [u8; 11]) -> Self {
        const FLOPPY_1440K: usize = 2880;
        let (mut sec_per_clus, root_entries, media) = if total_sectors <= FLOPPY_1440K {
            (1, 224, 0xf0)
        } else if total_sectors <= 4 * 2048 {
            (1, 512, 0xf8)
        } else if total_sectors <= 8 * 2048 {
            (2, 512, 0xf8)
        } else {
            (4, 512, 0xf8)
        };

        let reserved = 1usize;
        let num_fats = 2usize;
        let root_sectors = (root_entries * 32 + SECTOR_SIZE - 1) / SECTOR_SIZE;

        let fat_size = loop {
            let mut fat_size = 1usize;
            let mut clusters = 0usize;
            // FAT size and cluster count depend on each other; a few rounds
            // settle it.
            for _ in 0..8 {
                let data_start = reserved + num_fats * fat_size + root_sectors;
                clusters = total_sectors.saturating_sub(data_start) / sec_per_clus;
                let needed = ((clusters + 2) * 3 / 2 + SECTOR_SIZE - 1) / SECTOR_SIZE;
                if needed == fat_size {
                    break;
                }
                fat_size = needed;
            }
            if clusters <= MAX_CLUSTERS {
                break fat_size;
            }
            sec_per_clus *= 2;
        };

        let (tot16, tot32) = if total_sectors <= u16::MAX as usize {
            (total_sectors as u16, 0)
        } else {
            (0, total_sectors as u32)
        };

        Self {
            bpb_byts_per_sec: SECTOR_SIZE as u16,
            bpb_sec_per_clus: sec_per_clus as u8,
            bpb_rsvd_sec_cnt: reserved as u16,
            bpb_num_fats: num_fats as u8,
            bpb_root_ent_cnt: root_entries as u16,
            bpb_tot_sec_16: tot16,
            bpb_media: media,
            bpb_fat_sz_16: fat_size as u16,
            bpb_sec_per_trk: 18,
            bpb_num_heads: 2,
            bpb_hidd_sec: 0,
            bpb_tot_sec_32: tot32,
            vol_id: volume_id,
            vol_lab: label,
        }
    }
}

impl TryFrom<&'_ [u8]> for BootSector {
    type Error = Error;

    fn try_from(buf: &'_ [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 512 || !matches!(buf[510..512], [0x55, 0xaa]) {
            Err(Error::SignatureMismatch)?;
        }

        let bpb_byts_per_sec = u16::from_le_bytes(buf.array::<2>(11));
        let bpb_sec_per_clus = buf[13];
        let bpb_rsvd_sec_cnt = u16::from_le_bytes(buf.array::<2>(14));
        let bpb_num_fats = buf[16];
        let bpb_root_ent_cnt = u16::from_le_bytes(buf.array::<2>(17));
        let bpb_tot_sec_16 = u16::from_le_bytes(buf.array::<2>(19));
        let bpb_media = buf[21];
        let bpb_fat_sz_16 = u16::from_le_bytes(buf.array::<2>(22));
        let bpb_sec_per_trk = u16::from_le_bytes(buf.array::<2>(24));
        let bpb_num_heads = u16::from_le_bytes(buf.array::<2>(26));
        let bpb_hidd_sec = u32::from_le_bytes(buf.array::<4>(28));
        let bpb_tot_sec_32 = u32::from_le_bytes(buf.array::<4>(32));
        let vol_id = u32::from_le_bytes(buf.array::<4>(39));
        let vol_lab = buf.array::<11>(43);

        if bpb_byts_per_sec as usize != SECTOR_SIZE {
            Err(Error::Unsupported("BytsPerSec"))?;
        }
        if !bpb_sec_per_clus.is_power_of_two() {
            Err(Error::Broken("SecPerClus"))?;
        }
        if bpb_rsvd_sec_cnt == 0 {
            Err(Error::Broken("RsvdSecCnt"))?;
        }
        if bpb_num_fats < 1 {
            Err(Error::Broken("NumFATs"))?;
        }
        if bpb_fat_sz_16 == 0 {
            Err(Error::Unsupported("FATSz32"))?;
        }
        match (bpb_tot_sec_16, bpb_tot_sec_32) {
            (0, 0) => Err(Error::Broken("TotSec"))?,
            (n, m) if n != 0 && m != 0 && n as u32 != m => Err(Error::Broken("TotSec"))?,
            _ => {}
        }

        let bs = Self {
            bpb_byts_per_sec,
            bpb_sec_per_clus,
            bpb_rsvd_sec_cnt,
            bpb_num_fats,
            bpb_root_ent_cnt,
            bpb_tot_sec_16,
            bpb_media,
            bpb_fat_sz_16,
            bpb_sec_per_trk,
            bpb_num_heads,
            bpb_hidd_sec,
            bpb_tot_sec_32,
            vol_id,
            vol_lab,
        };
        if bs.total_sectors() < bs.data_start() {
            Err(Error::Broken("TotSec (smaller than metadata)"))?;
        }
        if bs.total_clusters() > MAX_CLUSTERS {
            Err(Error::Unsupported("FAT16/FAT32 cluster count"))?;
        }
        Ok(bs)
    }
}
