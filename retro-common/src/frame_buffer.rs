/// Linear framebuffer handed over by the loader. 32bpp packed little-endian,
/// `pitch` in bytes.
#[repr(C)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct FrameBuffer {
    pub base: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}
