use camino::{Utf8Path, Utf8PathBuf};
use std::fmt::Display;
use std::time::Duration;

/// Outcome of showing one image
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub path: Utf8PathBuf,
    pub success: bool,
    pub error: Option<String>,
    pub processing_time: Duration,
}

impl ItemResult {
    pub fn succeeded(path: &Utf8Path, processing_time: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            success: true,
            error: None,
            processing_time,
        }
    }

    pub fn failed(path: &Utf8Path, error: impl Display, processing_time: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            success: false,
            error: Some(error.to_string()),
            processing_time,
        }
    }
}

/// Aggregate outcome of a `run_test` call.
///
/// `success` is false only when the run never started or was cancelled;
/// individual image failures show up in `item_results` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub success: bool,
    pub total_images: usize,
    pub successful_images: usize,
    pub elapsed_time: Duration,
    pub item_results: Vec<ItemResult>,
    pub error: Option<String>,
}

impl RunResult {
    /// Every image was attempted
    pub fn completed(total_images: usize, item_results: Vec<ItemResult>, elapsed: Duration) -> Self {
        Self {
            success: true,
            total_images,
            successful_images: count_successes(&item_results),
            elapsed_time: elapsed,
            item_results,
            error: None,
        }
    }

    /// The run was stopped part-way; `item_results` holds what finished
    pub fn cancelled(total_images: usize, item_results: Vec<ItemResult>, elapsed: Duration) -> Self {
        Self {
            success: false,
            total_images,
            successful_images: count_successes(&item_results),
            elapsed_time: elapsed,
            item_results,
            error: Some("Test cancelled".to_string()),
        }
    }

    /// The run could not start at all
    pub fn rejected(error: impl Display) -> Self {
        Self {
            success: false,
            total_images: 0,
            successful_images: 0,
            elapsed_time: Duration::ZERO,
            item_results: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn failed_images(&self) -> usize {
        self.item_results.len() - self.successful_images
    }

    /// One-line summary for logs and the console
    pub fn summary(&self) -> String {
        match (&self.error, self.success) {
            (None, true) => format!(
                "{}/{} images successful in {:.2}s",
                self.successful_images,
                self.total_images,
                self.elapsed_time.as_secs_f64()
            ),
            (Some(error), _) if self.item_results.is_empty() => error.clone(),
            (error, _) => format!(
                "{} after {}/{} images ({} successful)",
                error.as_deref().unwrap_or("Test failed"),
                self.item_results.len(),
                self.total_images,
                self.successful_images
            ),
        }
    }
}

fn count_successes(items: &[ItemResult]) -> usize {
    items.iter().filter(|r| r.success).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<ItemResult> {
        vec![
            ItemResult::succeeded(Utf8Path::new("a.png"), Duration::from_millis(5)),
            ItemResult::failed(Utf8Path::new("b.png"), "Image not found", Duration::ZERO),
            ItemResult::succeeded(Utf8Path::new("c.png"), Duration::from_millis(7)),
        ]
    }

    #[test]
    fn test_completed_counts_successes() {
        let result = RunResult::completed(3, items(), Duration::from_secs(1));
        assert!(result.success);
        assert_eq!(result.successful_images, 2);
        assert_eq!(result.failed_images(), 1);
        assert_eq!(result.summary(), "2/3 images successful in 1.00s");
    }

    #[test]
    fn test_cancelled_is_unsuccessful() {
        let mut partial = items();
        partial.truncate(1);
        let result = RunResult::cancelled(3, partial, Duration::from_millis(10));

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Test cancelled"));
        assert_eq!(result.summary(), "Test cancelled after 1/3 images (1 successful)");
    }

    #[test]
    fn test_rejected_summary_is_error() {
        let result = RunResult::rejected("Test already running");
        assert!(!result.success);
        assert_eq!(result.total_images, 0);
        assert_eq!(result.summary(), "Test already running");
    }

    #[test]
    fn test_failed_item_keeps_message() {
        let item = ItemResult::failed(Utf8Path::new("x.png"), "boom", Duration::ZERO);
        assert!(!item.success);
        assert_eq!(item.error.as_deref(), Some("boom"));
    }
}
