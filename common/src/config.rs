//! Configuration types for runtime and execution settings

/// Default flow-control window of a stream, in bytes.
pub const DEFAULT_STREAM_WINDOW: u64 = 256 * 1024;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Settings of the streams used for cross-backend copies
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Maximum number of bytes in flight (sent but not acknowledged) per stream
    pub window: u64,
    /// Route copies within one backend through a tar stream instead of the backend's own copy
    pub force_stream: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_STREAM_WINDOW,
            force_stream: false,
        }
    }
}

impl StreamConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.window == 0 {
            return Err("stream window must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_is_rejected() {
        let config = StreamConfig {
            window: 0,
            force_stream: false,
        };
        assert!(config.validate().is_err());
        assert!(StreamConfig::default().validate().is_ok());
    }
}
