use crate::frame_buffer::FrameBuffer;
use crate::memory_map::MemoryMap;

/// Record passed from the stage-2 loader to `kernel_main`.
///
/// The loader carves the kernel image, stack and heap out of the usable
/// ranges before handoff, so the kernel can register those regions itself
/// without overlapping the map.
#[repr(C)]
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct BootInfo {
    pub magic: u32,
    pub vesa: VesaInfo,
    pub memory_map: MemoryMap,
}

impl BootInfo {
    pub const MAGIC: u32 = 0x52f0_0d05;

    pub fn magic_matches(&self) -> bool {
        self.magic == Self::MAGIC
    }
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct VesaInfo {
    /// Non-zero when the loader negotiated a VESA mode; otherwise the kernel
    /// stays on the VGA text fallback and `frame_buffer` is meaningless.
    pub enabled: u32,
    pub frame_buffer: FrameBuffer,
}
