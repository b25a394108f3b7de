use crate::x86;

pub fn initialize() {
    if log::set_logger(&KernelLogger).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        x86::without_interrupts(|| {
            // The unlocked port keeps panic and IRQ paths from deadlocking on
            // the logger.
            #[cfg(target_arch = "x86")]
            {
                use core::fmt::Write;
                let _ = writeln!(
                    crate::devices::serial::raw_default_port(),
                    "{}: {}",
                    record.level(),
                    record.args()
                );
            }
            #[cfg(not(target_arch = "x86"))]
            let _ = record;
        });
    }

    fn flush(&self) {}
}
