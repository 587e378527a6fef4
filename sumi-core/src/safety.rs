use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Flagged { reason: String },
}

/// Post-generation content classifier.
pub trait SafetyChecker: Send + Sync {
    fn check(&self, image: &RgbImage) -> Result<SafetyVerdict>;
}

/// What the stage did with an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyOutcome {
    /// No checker is configured.
    Unchecked,
    Passed,
    /// Flagged and replaced with a black image.
    Suppressed,
    /// Flagged, or the check failed, but the stage is in bypass mode.
    Bypassed,
}

/// Runs the configured checker over every generated image.
///
/// In bypass mode the checker still runs and its verdict is logged, but the
/// image always passes through untouched.
#[derive(Clone)]
pub struct SafetyStage {
    checker: Option<Arc<dyn SafetyChecker>>,
    enforce: bool,
}

impl SafetyStage {
    pub fn new(checker: Option<Arc<dyn SafetyChecker>>, enforce: bool) -> Self {
        Self { checker, enforce }
    }

    pub fn apply(&self, image: RgbImage) -> Result<(RgbImage, SafetyOutcome)> {
        let Some(checker) = &self.checker else {
            debug!("no safety checker configured");
            return Ok((image, SafetyOutcome::Unchecked));
        };

        let verdict = match checker.check(&image) {
            Ok(verdict) => verdict,
            Err(e) if !self.enforce => {
                warn!(error = %e, "safety check failed, passing image through");
                return Ok((image, SafetyOutcome::Bypassed));
            }
            Err(e) => return Err(e.context("safety check failed")),
        };

        match verdict {
            SafetyVerdict::Safe => {
                info!("safety check passed");
                Ok((image, SafetyOutcome::Passed))
            }
            SafetyVerdict::Flagged { reason } if self.enforce => {
                warn!(%reason, "safety check flagged image, suppressing output");
                let (width, height) = image.dimensions();
                Ok((RgbImage::new(width, height), SafetyOutcome::Suppressed))
            }
            SafetyVerdict::Flagged { reason } => {
                info!(%reason, "safety check flagged image, bypass enabled");
                Ok((image, SafetyOutcome::Bypassed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlagEverything {
        calls: AtomicUsize,
    }

    impl SafetyChecker for FlagEverything {
        fn check(&self, _image: &RgbImage) -> Result<SafetyVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SafetyVerdict::Flagged {
                reason: "test".into(),
            })
        }
    }

    fn white(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb([255, 255, 255]))
    }

    #[test]
    fn enforced_stage_blacks_out_flagged_image() {
        let checker = Arc::new(FlagEverything {
            calls: AtomicUsize::new(0),
        });
        let stage = SafetyStage::new(Some(checker.clone()), true);
        let (image, outcome) = stage.apply(white(4, 3)).unwrap();
        assert_eq!(outcome, SafetyOutcome::Suppressed);
        assert_eq!(image.dimensions(), (4, 3));
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bypassed_stage_runs_checker_but_never_blocks() {
        let checker = Arc::new(FlagEverything {
            calls: AtomicUsize::new(0),
        });
        let stage = SafetyStage::new(Some(checker.clone()), false);
        let (image, outcome) = stage.apply(white(2, 2)).unwrap();
        assert_eq!(outcome, SafetyOutcome::Bypassed);
        assert!(image.pixels().all(|p| p.0 == [255, 255, 255]));
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_checker_passes_through() {
        let stage = SafetyStage::new(None, true);
        let (_, outcome) = stage.apply(white(1, 1)).unwrap();
        assert_eq!(outcome, SafetyOutcome::Unchecked);
    }
}
