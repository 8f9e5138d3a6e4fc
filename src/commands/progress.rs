//! Flash progress rendered with indicatif

use c0flash_core::flash::FlashProgress;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner that follows the write-verify attempts
pub struct SpinnerProgress {
    what: String,
    bar: Option<ProgressBar>,
}

impl SpinnerProgress {
    pub fn new(what: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            bar: None,
        }
    }

    fn bar(&mut self) -> &ProgressBar {
        self.bar.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        })
    }

    /// Stop the spinner, leaving `message` behind
    pub fn finish(&mut self, message: &str) {
        if let Some(pb) = self.bar.take() {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl FlashProgress for SpinnerProgress {
    fn attempt(&mut self, attempt: u32, max_attempts: u32, bytes: usize) {
        let message = format!(
            "Flashing {} ({} bytes), attempt {}/{}",
            self.what, bytes, attempt, max_attempts
        );
        self.bar().set_message(message);
    }

    fn verifying(&mut self) {
        let message = format!("Verifying {}", self.what);
        self.bar().set_message(message);
    }

    fn verified(&mut self, matched: bool) {
        if !matched {
            self.bar().println("Verification failed, retrying");
        }
    }
}

impl Drop for SpinnerProgress {
    fn drop(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.abandon();
        }
    }
}
