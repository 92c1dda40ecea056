//! Utility functions shared by the training components

use std::fs;
use std::path::Path;

use crate::error::Result;

/// File I/O utilities
pub mod io {
    use super::*;

    /// Ensure directory exists
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Check if file exists and is readable
    pub fn is_file_readable<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        path.is_file() && fs::metadata(path).is_ok()
    }

    /// Move a fully written temporary file over its destination
    ///
    /// The rename is atomic on the same filesystem, so readers either see the
    /// previous file or the complete new one.
    pub fn commit_atomic<P: AsRef<Path>, Q: AsRef<Path>>(temp_path: P, path: Q) -> Result<()> {
        fs::rename(temp_path.as_ref(), path.as_ref())?;
        Ok(())
    }
}

/// Performance timing utilities
pub mod timing {
    use std::time::{Duration, Instant};

    /// Simple timer for measuring performance
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start a new timer
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                start: Instant::now(),
                name: name.into(),
            }
        }

        /// Get elapsed time
        pub fn elapsed(&self) -> Duration {
            self.start.elapsed()
        }

        /// Get elapsed time in milliseconds
        pub fn elapsed_ms(&self) -> f64 {
            self.elapsed().as_secs_f64() * 1000.0
        }

        /// Stop timer and log result
        pub fn stop(self) -> Duration {
            let elapsed = self.elapsed();
            tracing::debug!("Timer '{}' elapsed: {:.2}ms", self.name, self.elapsed_ms());
            elapsed
        }
    }

    /// Render whole seconds as `H:MM:SS`
    pub fn format_hms(seconds: f64) -> String {
        let total = if seconds.is_finite() && seconds > 0.0 {
            seconds as u64
        } else {
            0
        };
        format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

/// Configuration utilities
pub mod config {
    use super::*;
    use serde::Deserialize;

    /// Load configuration from file
    pub fn load_config<T, P>(path: P) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
        P: AsRef<Path>,
    {
        let content = fs::read_to_string(path.as_ref())?;

        let config = if is_yaml(path.as_ref()) {
            serde_yaml::from_str(&content)?
        } else {
            // Default to JSON
            serde_json::from_str(&content)?
        };

        Ok(config)
    }

    fn is_yaml(path: &Path) -> bool {
        path.extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml")
    }
}
