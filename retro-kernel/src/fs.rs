pub mod fat12;
pub mod path;
pub mod vfs;
pub mod volume;
