#![no_std]

pub mod boot_info;
pub mod frame_buffer;
pub mod memory_map;
