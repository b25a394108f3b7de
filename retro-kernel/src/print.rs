use core::fmt;

/// Shell/monitor output funnel. On hardware this is the serial port (the
/// phosphor terminal renderer attaches here as a collaborator); hosted test
/// builds discard the text.
#[derive(Debug)]
pub struct KernelWrite;

impl fmt::Write for KernelWrite {
    #[cfg(target_arch = "x86")]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use core::fmt::Write as _;
        crate::devices::serial::default_port().write_str(s)
    }

    #[cfg(not(target_arch = "x86"))]
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

#[allow(unused_macros)]
macro_rules! kprintln {
    ($( $t:tt )*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::print::KernelWrite, $( $t )*);
    }};
}

#[allow(unused_macros)]
macro_rules! kprint {
    ($( $t:tt )*) => {{
        use core::fmt::Write;
        let _ = write!($crate::print::KernelWrite, $( $t )*);
    }};
}
