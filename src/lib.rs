//! Two-page spread detection for scanned books, and the page split/undo state
//! manager that applies a detected split to a book's page sequence.

pub mod doublepage;
pub mod pages;

pub use doublepage::{
    detect, detect_with_config, CachedDetector, Confidence, DetectError, DetectionConfig,
    DetectionResult, Detector, HeuristicDetector, HybridDetector,
};
pub use pages::{
    BookId, Crop, CropDecision, Page, PageError, PageId, PageKind, PageSplitManager, PageStore,
};
