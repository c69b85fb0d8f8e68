//! Per-worker monoio runtime selection: io_uring on Linux when available,
//! the legacy epoll-based driver everywhere else.

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, utils::detect_uring, LegacyDriver, Runtime, RuntimeBuilder};

use crate::config::{RuntimeConfig, RuntimeType};

pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl From<&RuntimeConfig> for RuntimeWrapper {
    fn from(config: &RuntimeConfig) -> Self {
        #[cfg(target_os = "linux")]
        let runtime_type = match config.runtime_type {
            Some(RuntimeType::Legacy) => RuntimeType::Legacy,
            _ if detect_uring() => RuntimeType::IoUring,
            _ => RuntimeType::Legacy,
        };
        #[cfg(not(target_os = "linux"))]
        let runtime_type = RuntimeType::Legacy;

        match runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => {
                let builder = RuntimeBuilder::<monoio::IoUringDriver>::new();
                let runtime =
                    builder.enable_timer().with_entries(config.entries).build().expect("build io_uring runtime");
                RuntimeWrapper::IoUring(runtime)
            }
            RuntimeType::Legacy => {
                let runtime = RuntimeBuilder::<monoio::LegacyDriver>::new()
                    .enable_timer()
                    .with_entries(config.entries)
                    .build()
                    .expect("build legacy runtime");
                RuntimeWrapper::Legacy(runtime)
            }
        }
    }
}

impl RuntimeWrapper {
    pub fn block_on<F: std::future::Future>(&mut self, future: F) -> F::Output {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}
