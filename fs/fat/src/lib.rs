// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use cardfs_cache::CacheController;
use cardfs_device::{BlockDevice, BLOCK_SIZE};
use cardfs_err::{Error, FsError, MountError, Result};
use cardfs_fs::FileSystem;
use log::{debug, error, trace};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

/// End-of-chain FAT values start here; the terminator written for new chains.
const FAT_EOC_MIN: u32 = 0x0FFF_FFF8;
const FAT_EOC: u32 = 0x0FFF_FFFF;
const FAT_FREE: u32 = 0x0000_0000;
const ENTRIES_PER_SECTOR: usize = BLOCK_SIZE / 32;

/// A 512-byte, cache-line-aligned scratch buffer, mirroring the
/// `__attribute__((aligned(32)))` scratch sectors the block/cache layers
/// require.
#[repr(align(32))]
struct AlignedSector([u8; BLOCK_SIZE]);

impl Default for AlignedSector {
    fn default() -> Self {
        AlignedSector([0u8; BLOCK_SIZE])
    }
}

mod bpb {
    pub const BYTES_PER_SECTOR: usize = 0x0B;
    pub const SECTORS_PER_CLUSTER: usize = 0x0D;
    pub const RESERVED_SECTORS: usize = 0x0E;
    pub const NUM_FATS: usize = 0x10;
    pub const TOTAL_SECTORS_32: usize = 0x20;
    pub const FAT_SIZE_32: usize = 0x24;
    pub const ROOT_CLUSTER: usize = 0x2C;
}

mod dirent {
    pub const NAME: usize = 0x00;
    pub const NAME_LEN: usize = 11;
    pub const ATTR: usize = 0x0B;
    pub const CLUSTER_HI: usize = 0x14;
    pub const CLUSTER_LO: usize = 0x1A;
    pub const SIZE: usize = 0x1C;
    pub const ATTR_ARCHIVE: u8 = 0x20;
}

const MBR_PARTITION_TABLE: usize = 0x1BE;
const MBR_LBA_START_OFFSET: usize = 8;

/// Reads a little-endian `u16` at `offset` from a documented on-disk field
/// position. Fields are read one at a time rather than overlaying a single
/// struct on the buffer.
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    U16::ref_from_bytes(&buf[offset..offset + 2]).unwrap().get()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    U32::ref_from_bytes(&buf[offset..offset + 4]).unwrap().get()
}

fn write_u16(buf: &mut [u8], offset: usize, v: u16) {
    U16::new(v).write_to(&mut buf[offset..offset + 2]).unwrap();
}

fn write_u32(buf: &mut [u8], offset: usize, v: u32) {
    U32::new(v).write_to(&mut buf[offset..offset + 4]).unwrap();
}

/// Canonicalize a path component into an 11-byte 8.3 name: uppercase,
/// space-padded, `.` switching the write cursor to the extension slot.
/// Characters beyond the 8-byte base or 3-byte extension are discarded.
fn format_83_name(component: &[u8]) -> [u8; dirent::NAME_LEN] {
    let mut dest = [b' '; dirent::NAME_LEN];
    let mut dest_idx = 0usize;
    let mut ext_mode = false;
    for &c in component {
        if c == b'.' {
            ext_mode = true;
            dest_idx = 8;
            continue;
        }
        let c = if c.is_ascii_lowercase() { c - 32 } else { c };
        if ext_mode {
            if dest_idx < 11 {
                dest[dest_idx] = c;
                dest_idx += 1;
            }
        } else if dest_idx < 8 {
            dest[dest_idx] = c;
            dest_idx += 1;
        }
    }
    dest
}

/// A FAT32 file handle. Created by [`Volume::open`]/[`Volume::create`],
/// driven by `read`/`write`/`seek`, and released with `close`.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    start_cluster: u32,
    current_cluster: u32,
    size: u32,
    position: u32,
    dir_sector: u32,
    dir_offset: u32,
}

struct FatCache {
    sector: Option<u32>,
    buf: AlignedSector,
    dirty: bool,
}

impl Default for FatCache {
    fn default() -> Self {
        FatCache {
            sector: None,
            buf: AlignedSector::default(),
            dirty: false,
        }
    }
}

/// A mounted FAT32 volume over a block device, with a single-sector FAT
/// cache and a cache-maintenance discipline around every device-touched
/// buffer.
pub struct Volume<BD: BlockDevice, CC: CacheController> {
    device: BD,
    cache: CC,

    fat_start_lba: u32,
    data_start_lba: u32,
    sectors_per_cluster: u32,
    bytes_per_cluster: u32,
    root_cluster: u32,
    fat_size_sectors: u32,
    total_clusters: u32,

    fat_cache: FatCache,
}

impl<BD: BlockDevice, CC: CacheController> Volume<BD, CC> {
    pub fn new(device: BD, cache: CC) -> Self {
        Volume {
            device,
            cache,
            fat_start_lba: 0,
            data_start_lba: 0,
            sectors_per_cluster: 0,
            bytes_per_cluster: 0,
            root_cluster: 0,
            fat_size_sectors: 0,
            total_clusters: 0,
            fat_cache: FatCache::default(),
        }
    }

    /// `cluster_to_lba(c) = data_start_lba + (c - 2) * sectors_per_cluster`
    /// for `c >= 2`; undefined (returns 0) for `c < 2`.
    pub fn cluster_to_lba(&self, cluster: u32) -> u32 {
        if cluster < 2 {
            return 0;
        }
        self.data_start_lba + (cluster - 2) * self.sectors_per_cluster
    }

    fn ensure_fat_sector(&mut self, fat_sector: u32) -> Result<()> {
        if self.fat_cache.sector == Some(fat_sector) {
            return Ok(());
        }
        if self.fat_cache.dirty {
            let prev = self.fat_cache.sector.expect("dirty cache must have a sector");
            self.cache.clean(&self.fat_cache.buf.0);
            self.device
                .write_block(prev, &self.fat_cache.buf.0)?;
            self.fat_cache.dirty = false;
        }
        self.device
            .read_block(fat_sector, &mut self.fat_cache.buf.0)?;
        self.cache.invalidate(&mut self.fat_cache.buf.0);
        self.fat_cache.sector = Some(fat_sector);
        trace!("fat cache refilled from sector {fat_sector}");
        Ok(())
    }

    /// `get_next(current)`: the 28-bit FAT entry for `current`, served from
    /// the single-sector write-through cache.
    pub fn get_next(&mut self, current: u32) -> Result<u32> {
        let fat_offset = current * 4;
        let fat_sector = self.fat_start_lba + fat_offset / BLOCK_SIZE as u32;
        let ent_offset = (fat_offset % BLOCK_SIZE as u32) as usize;
        self.ensure_fat_sector(fat_sector)?;
        Ok(read_u32(&self.fat_cache.buf.0, ent_offset) & 0x0FFF_FFFF)
    }

    /// `set_next(current, next)`: read-modify-write preserving the top 4
    /// bits, then write the sector back immediately.
    pub fn set_next(&mut self, current: u32, next: u32) -> Result<()> {
        let fat_offset = current * 4;
        let fat_sector = self.fat_start_lba + fat_offset / BLOCK_SIZE as u32;
        let ent_offset = (fat_offset % BLOCK_SIZE as u32) as usize;
        self.ensure_fat_sector(fat_sector)?;

        let old = read_u32(&self.fat_cache.buf.0, ent_offset);
        let new_val = (old & 0xF000_0000) | (next & 0x0FFF_FFFF);
        write_u32(&mut self.fat_cache.buf.0, ent_offset, new_val);
        self.fat_cache.dirty = true;

        self.cache.clean(&self.fat_cache.buf.0);
        self.device
            .write_block(fat_sector, &self.fat_cache.buf.0)?;
        self.fat_cache.dirty = false;
        Ok(())
    }

    /// Linear scan from cluster 2 for the first free entry. Returns 0 if the
    /// volume is full.
    pub fn find_free_cluster(&mut self) -> Result<u32> {
        for c in 2..self.total_clusters {
            if self.get_next(c)? == FAT_FREE {
                return Ok(c);
            }
        }
        Ok(0)
    }

    fn walk_next(&mut self, steps: &mut u32, current: u32) -> Result<u32> {
        *steps += 1;
        if *steps > self.total_clusters {
            return Err(FsError::Corrupt.into());
        }
        self.get_next(current)
    }

    fn zero_fill_cluster(&mut self, cluster: u32) -> Result<()> {
        let lba = self.cluster_to_lba(cluster);
        let zero = AlignedSector::default();
        self.cache.clean(&zero.0);
        for s in 0..self.sectors_per_cluster {
            self.device.write_block(lba + s, &zero.0)?;
        }
        Ok(())
    }

    fn allocate_linked_cluster(&mut self, tail: u32) -> Result<u32> {
        let new_c = self.find_free_cluster()?;
        if new_c == 0 {
            return Err(FsError::NoSpace.into());
        }
        self.set_next(tail, new_c)?;
        self.set_next(new_c, FAT_EOC)?;
        self.zero_fill_cluster(new_c)?;
        Ok(new_c)
    }

    /// Locate `target` within the directory chain starting at `cluster`.
    /// Returns the matched entry's cluster/size and its on-disk position.
    fn find_in_directory(
        &mut self,
        mut cluster: u32,
        target: &[u8; dirent::NAME_LEN],
    ) -> Result<(u32, u32, u32, u32)> {
        let mut steps = 0u32;
        while cluster >= 2 && cluster < FAT_EOC_MIN {
            let lba = self.cluster_to_lba(cluster);
            for s in 0..self.sectors_per_cluster {
                let mut buf = AlignedSector::default();
                self.device
                    .read_block(lba + s, &mut buf.0)?;
                self.cache.invalidate(&mut buf.0);

                for i in 0..ENTRIES_PER_SECTOR {
                    let base = i * 32;
                    let first_byte = buf.0[base];
                    if first_byte == 0x00 {
                        return Err(FsError::NotFound.into());
                    }
                    if first_byte == 0xE5 {
                        continue;
                    }
                    if &buf.0[base..base + dirent::NAME_LEN] == target {
                        let cluster_hi = read_u16(&buf.0, base + dirent::CLUSTER_HI) as u32;
                        let cluster_lo = read_u16(&buf.0, base + dirent::CLUSTER_LO) as u32;
                        let size = read_u32(&buf.0, base + dirent::SIZE);
                        return Ok(((cluster_hi << 16) | cluster_lo, size, lba + s, base as u32));
                    }
                }
            }
            cluster = self.walk_next(&mut steps, cluster)?;
        }
        Err(FsError::NotFound.into())
    }

    fn split_path(path: &str) -> Result<Vec<&[u8]>> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let components: Vec<&[u8]> = path
            .split('/')
            .map(str::as_bytes)
            .filter(|c| !c.is_empty())
            .collect();
        if components.is_empty() {
            return Err(FsError::InvalidArgument.into());
        }
        Ok(components)
    }

    fn patch_dir_entry<F: FnOnce(&mut [u8])>(&mut self, dir_sector: u32, dir_offset: u32, patch: F) -> Result<()> {
        let mut buf = AlignedSector::default();
        self.device
            .read_block(dir_sector, &mut buf.0)?;
        self.cache.invalidate(&mut buf.0);
        let base = dir_offset as usize;
        patch(&mut buf.0[base..base + 32]);
        self.cache.clean(&buf.0);
        self.device
            .write_block(dir_sector, &buf.0)?;
        Ok(())
    }
}

impl<BD: BlockDevice, CC: CacheController> FileSystem for Volume<BD, CC> {
    type Handle = FileHandle;

    fn mount(&mut self) -> Result<()> {
        let mut buf = AlignedSector::default();
        self.device.read_block(0, &mut buf.0)?;
        self.cache.invalidate(&mut buf.0);

        let mut partition_lba = 0u32;
        let is_super_floppy = read_u16(&buf.0, bpb::BYTES_PER_SECTOR) == 512;

        if !is_super_floppy {
            let lba_start = read_u32(&buf.0, MBR_PARTITION_TABLE + MBR_LBA_START_OFFSET);
            if lba_start == 0 {
                error!("mount: MBR first partition entry is empty");
                return Err(MountError::PartitionEmpty.into());
            }
            partition_lba = lba_start;
            self.device
                .read_block(partition_lba, &mut buf.0)?;
            self.cache.invalidate(&mut buf.0);
            if read_u16(&buf.0, bpb::BYTES_PER_SECTOR) != 512 {
                error!("mount: BPB at partition LBA {partition_lba} has bytes_per_sector != 512");
                return Err(MountError::InvalidBpb.into());
            }
        }

        let sectors_per_cluster = buf.0[bpb::SECTORS_PER_CLUSTER] as u32;
        let reserved_sectors = read_u16(&buf.0, bpb::RESERVED_SECTORS) as u32;
        let num_fats = buf.0[bpb::NUM_FATS] as u32;
        let fat_size_32 = read_u32(&buf.0, bpb::FAT_SIZE_32);
        let total_sectors_32 = read_u32(&buf.0, bpb::TOTAL_SECTORS_32);
        let root_cluster = read_u32(&buf.0, bpb::ROOT_CLUSTER);

        if sectors_per_cluster == 0 || num_fats == 0 || fat_size_32 == 0 || total_sectors_32 == 0 {
            error!("mount: BPB fields are inconsistent");
            return Err(if is_super_floppy {
                MountError::NoBpbAtSectorZero.into()
            } else {
                MountError::InvalidBpb.into()
            });
        }

        self.fat_start_lba = partition_lba + reserved_sectors;
        self.fat_size_sectors = fat_size_32;
        self.data_start_lba = self.fat_start_lba + num_fats * fat_size_32;
        self.sectors_per_cluster = sectors_per_cluster;
        self.bytes_per_cluster = sectors_per_cluster * BLOCK_SIZE as u32;
        self.root_cluster = root_cluster;
        self.total_clusters = total_sectors_32 / sectors_per_cluster;
        self.fat_cache = FatCache::default();

        debug!(
            "mounted: fat_start_lba={} data_start_lba={} bytes_per_cluster={} root_cluster={}",
            self.fat_start_lba, self.data_start_lba, self.bytes_per_cluster, self.root_cluster
        );
        Ok(())
    }

    fn open(&mut self, path: &str) -> Result<FileHandle> {
        let components = Self::split_path(path)?;
        let mut current_cluster = self.root_cluster;
        let mut result = (0u32, 0u32, 0u32, 0u32);
        for (idx, component) in components.iter().enumerate() {
            let target = format_83_name(component);
            let found = self.find_in_directory(current_cluster, &target)?;
            current_cluster = found.0;
            if idx == components.len() - 1 {
                result = found;
            }
        }
        let (cluster, size, dir_sector, dir_offset) = result;
        Ok(FileHandle {
            start_cluster: cluster,
            current_cluster: cluster,
            size,
            position: 0,
            dir_sector,
            dir_offset,
        })
    }

    fn create(&mut self, path: &str) -> Result<FileHandle> {
        let components = Self::split_path(path)?;
        let target = format_83_name(components[components.len() - 1]);

        let mut search_cluster = self.root_cluster;
        let mut slot = None;
        let mut steps = 0u32;
        'search: while search_cluster >= 2 && search_cluster < FAT_EOC_MIN {
            let lba = self.cluster_to_lba(search_cluster);
            for s in 0..self.sectors_per_cluster {
                let mut buf = AlignedSector::default();
                self.device
                    .read_block(lba + s, &mut buf.0)?;
                self.cache.invalidate(&mut buf.0);
                for i in 0..ENTRIES_PER_SECTOR {
                    let first_byte = buf.0[i * 32];
                    if first_byte == 0x00 || first_byte == 0xE5 {
                        slot = Some((lba + s, (i * 32) as u32));
                        break 'search;
                    }
                }
            }

            let next = self.walk_next(&mut steps, search_cluster)?;
            if next >= FAT_EOC_MIN {
                search_cluster = self.allocate_linked_cluster(search_cluster)?;
            } else {
                search_cluster = next;
            }
        }

        let (dir_sector, dir_offset) = slot.ok_or(Error::Fs(FsError::NoSpace))?;
        self.patch_dir_entry(dir_sector, dir_offset, |entry| {
            entry.fill(0);
            entry[dirent::NAME..dirent::NAME + dirent::NAME_LEN].copy_from_slice(&target);
            entry[dirent::ATTR] = dirent::ATTR_ARCHIVE;
        })?;

        Ok(FileHandle {
            start_cluster: 0,
            current_cluster: 0,
            size: 0,
            position: 0,
            dir_sector,
            dir_offset,
        })
    }

    fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if handle.position >= handle.size {
            return Ok(0);
        }
        let mut remaining = buf.len().min((handle.size - handle.position) as usize) as u32;
        let mut out_offset = 0usize;
        let mut steps = 0u32;

        while remaining > 0 {
            let cluster_offset = handle.position % self.bytes_per_cluster;
            let sector_idx = cluster_offset / BLOCK_SIZE as u32;
            let byte_idx = (cluster_offset % BLOCK_SIZE as u32) as usize;
            let lba = self.cluster_to_lba(handle.current_cluster) + sector_idx;

            let aligned = byte_idx == 0
                && remaining >= BLOCK_SIZE as u32
                && (buf[out_offset..].as_ptr() as usize) % 4 == 0;

            let advanced = if aligned {
                let dest: &mut [u8; BLOCK_SIZE] = (&mut buf[out_offset..out_offset + BLOCK_SIZE])
                    .try_into()
                    .unwrap();
                self.device.read_block(lba, dest)?;
                self.cache.invalidate(dest);
                BLOCK_SIZE as u32
            } else {
                let mut scratch = AlignedSector::default();
                self.device
                    .read_block(lba, &mut scratch.0)?;
                self.cache.invalidate(&mut scratch.0);
                let chunk = ((BLOCK_SIZE - byte_idx) as u32).min(remaining);
                buf[out_offset..out_offset + chunk as usize]
                    .copy_from_slice(&scratch.0[byte_idx..byte_idx + chunk as usize]);
                chunk
            };

            handle.position += advanced;
            out_offset += advanced as usize;
            remaining -= advanced;

            if handle.position % self.bytes_per_cluster == 0 && remaining > 0 {
                handle.current_cluster = self.walk_next(&mut steps, handle.current_cluster)?;
            }
        }

        Ok(out_offset)
    }

    fn write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        if handle.dir_sector == 0 {
            return Err(FsError::InvalidHandle.into());
        }

        if handle.start_cluster == 0 && !buf.is_empty() {
            let new_c = self.find_free_cluster()?;
            if new_c == 0 {
                return Err(FsError::NoSpace.into());
            }
            self.set_next(new_c, FAT_EOC)?;
            self.zero_fill_cluster(new_c)?;
            handle.start_cluster = new_c;
            handle.current_cluster = new_c;

            let (dir_sector, dir_offset) = (handle.dir_sector, handle.dir_offset);
            self.patch_dir_entry(dir_sector, dir_offset, |entry| {
                write_u16(entry, dirent::CLUSTER_HI, (new_c >> 16) as u16);
                write_u16(entry, dirent::CLUSTER_LO, (new_c & 0xFFFF) as u16);
            })?;
        }

        let mut remaining = buf.len() as u32;
        let mut in_offset = 0usize;
        let mut bytes_written = 0u32;
        let mut steps = 0u32;

        while remaining > 0 {
            let cluster_offset = handle.position % self.bytes_per_cluster;
            let sector_idx = cluster_offset / BLOCK_SIZE as u32;
            let byte_idx = (cluster_offset % BLOCK_SIZE as u32) as usize;
            let lba = self.cluster_to_lba(handle.current_cluster) + sector_idx;

            let advanced = if byte_idx == 0 && remaining >= BLOCK_SIZE as u32 {
                let mut scratch = AlignedSector::default();
                scratch
                    .0
                    .copy_from_slice(&buf[in_offset..in_offset + BLOCK_SIZE]);
                self.cache.clean(&scratch.0);
                self.device
                    .write_block(lba, &scratch.0)?;
                BLOCK_SIZE as u32
            } else {
                let mut scratch = AlignedSector::default();
                self.device
                    .read_block(lba, &mut scratch.0)?;
                self.cache.invalidate(&mut scratch.0);
                let chunk = ((BLOCK_SIZE - byte_idx) as u32).min(remaining);
                scratch.0[byte_idx..byte_idx + chunk as usize]
                    .copy_from_slice(&buf[in_offset..in_offset + chunk as usize]);
                self.cache.clean(&scratch.0);
                self.device
                    .write_block(lba, &scratch.0)?;
                chunk
            };

            handle.position += advanced;
            bytes_written += advanced;
            in_offset += advanced as usize;
            remaining -= advanced;

            if handle.position % self.bytes_per_cluster == 0 && remaining > 0 {
                let next = self.walk_next(&mut steps, handle.current_cluster)?;
                handle.current_cluster = if next >= FAT_EOC_MIN {
                    self.allocate_linked_cluster(handle.current_cluster)?
                } else {
                    next
                };
            }
        }

        if handle.position > handle.size {
            handle.size = handle.position;
            let (dir_sector, dir_offset, size) = (handle.dir_sector, handle.dir_offset, handle.size);
            self.patch_dir_entry(dir_sector, dir_offset, |entry| {
                write_u32(entry, dirent::SIZE, size);
            })?;
        }

        Ok(bytes_written as usize)
    }

    fn seek(&mut self, handle: &mut FileHandle, offset: u64) -> Result<()> {
        if offset > handle.size as u64 {
            return Err(FsError::InvalidArgument.into());
        }
        handle.position = offset as u32;
        handle.current_cluster = handle.start_cluster;
        let clusters_to_skip = offset as u32 / self.bytes_per_cluster;
        let mut steps = 0u32;
        for _ in 0..clusters_to_skip {
            handle.current_cluster = self.walk_next(&mut steps, handle.current_cluster)?;
        }
        Ok(())
    }

    fn close(&mut self, _handle: FileHandle) -> Result<()> {
        if self.fat_cache.dirty {
            let sector = self.fat_cache.sector.expect("dirty cache must have a sector");
            self.cache.clean(&self.fat_cache.buf.0);
            self.device
                .write_block(sector, &self.fat_cache.buf.0)?;
            self.fat_cache.dirty = false;
        }
        Ok(())
    }
}
