use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::doublepage::vision::VisionRegions;
use crate::doublepage::DetectionResult;

pub mod storage;
pub use storage::{InMemoryPageStore, NewPage, PageStore, StoreError};
#[cfg(feature = "page-sqlite")]
pub use storage::SqlitePageStore;

/// Upper bound of the resolution-independent split scale.
pub const SCALE_MAX: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(String);

impl PageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(String);

impl BookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Horizontal page region on the 0–1000 scale, `x_start < x_end <= 1000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawCrop")]
pub struct Crop {
    x_start: u16,
    x_end: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCrop {
    x_start: u16,
    x_end: u16,
}

impl TryFrom<RawCrop> for Crop {
    type Error = PageError;

    fn try_from(raw: RawCrop) -> Result<Self, Self::Error> {
        Crop::new(raw.x_start, raw.x_end)
    }
}

impl Crop {
    pub fn new(x_start: u16, x_end: u16) -> Result<Self, PageError> {
        if x_start >= x_end || x_end > SCALE_MAX {
            return Err(PageError::InvalidCrop(format!(
                "[{}, {}) is not a region of 0..{}",
                x_start, x_end, SCALE_MAX
            )));
        }
        Ok(Self { x_start, x_end })
    }

    /// Left and right halves either side of `split`.
    pub fn halves(split: u16) -> Result<(Self, Self), PageError> {
        Ok((Self::new(0, split)?, Self::new(split, SCALE_MAX)?))
    }

    pub fn x_start(&self) -> u16 {
        self.x_start
    }

    pub fn x_end(&self) -> u16 {
        self.x_end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PageKind {
    Original { crop: Option<Crop> },
    SplitRight { crop: Crop, parent: PageId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: PageId,
    pub book_id: BookId,
    /// 1-based position in the book.
    pub page_number: u32,
    pub image_url: Option<String>,
    pub kind: PageKind,
}

impl Page {
    pub fn crop(&self) -> Option<Crop> {
        match &self.kind {
            PageKind::Original { crop } => *crop,
            PageKind::SplitRight { crop, .. } => Some(*crop),
        }
    }

    pub fn is_split_right(&self) -> bool {
        matches!(self.kind, PageKind::SplitRight { .. })
    }

    pub fn is_split(&self) -> bool {
        self.crop().is_some()
    }
}

/// Flat row shape used by stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    pub id: PageId,
    pub book_id: BookId,
    pub page_number: u32,
    pub image_url: Option<String>,
    pub crop: Option<Crop>,
    pub split_from: Option<PageId>,
}

impl TryFrom<PageRecord> for Page {
    type Error = StoreError;

    fn try_from(record: PageRecord) -> Result<Self, Self::Error> {
        let kind = match (record.split_from, record.crop) {
            (None, crop) => PageKind::Original { crop },
            (Some(parent), Some(crop)) => PageKind::SplitRight { crop, parent },
            (Some(parent), None) => {
                return Err(StoreError::Corrupt(format!(
                    "page {} is split from {} but has no crop",
                    record.id, parent
                )))
            }
        };
        Ok(Page {
            id: record.id,
            book_id: record.book_id,
            page_number: record.page_number,
            image_url: record.image_url,
            kind,
        })
    }
}

impl From<&Page> for PageRecord {
    fn from(page: &Page) -> Self {
        let split_from = match &page.kind {
            PageKind::SplitRight { parent, .. } => Some(parent.clone()),
            PageKind::Original { .. } => None,
        };
        PageRecord {
            id: page.id.clone(),
            book_id: page.book_id.clone(),
            page_number: page.page_number,
            image_url: page.image_url.clone(),
            crop: page.crop(),
            split_from,
        }
    }
}

/// Where to cut a page, from whichever source decided it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CropDecision {
    Detected(DetectionResult),
    /// Legacy manual mode: split at `p` percent of the width.
    Percent(f64),
    Regions { left: Crop, right: Crop },
}

impl CropDecision {
    pub fn regions(&self) -> Result<(Crop, Crop), PageError> {
        match *self {
            CropDecision::Detected(result) => {
                if !result.is_two_page_spread {
                    return Err(PageError::NotASpread);
                }
                Crop::halves(result.split_position)
            }
            CropDecision::Percent(percent) => {
                if !percent.is_finite() || percent <= 0.0 || percent >= 100.0 {
                    return Err(PageError::InvalidCrop(format!(
                        "split percent {} outside (0, 100)",
                        percent
                    )));
                }
                Crop::halves((percent * 10.0).round() as u16)
            }
            CropDecision::Regions { left, right } => Ok((left, right)),
        }
    }
}

impl From<VisionRegions> for CropDecision {
    fn from(regions: VisionRegions) -> Self {
        CropDecision::Regions {
            left: regions.left,
            right: regions.right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitOutcome {
    pub updated_page: Page,
    pub new_sibling: Page,
    pub renumbered_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoOutcome {
    pub original_page: Page,
    pub deleted_sibling_id: Option<PageId>,
    pub renumbered_count: usize,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("page {0} not found")]
    NotFound(PageId),
    #[error("page {0} has no crop to reset")]
    NoCrop(PageId),
    #[error("page {0} is already split")]
    AlreadySplit(PageId),
    #[error("page {0} has no image to split")]
    NoImage(PageId),
    #[error("detection did not report a two-page spread")]
    NotASpread,
    #[error("invalid crop: {0}")]
    InvalidCrop(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies and reverses page splits. Every mutation of a book runs under that
/// book's lock and finishes with a full renumbering pass.
///
/// A failed renumber after a committed split or undo is healed by retrying the
/// same call: the early `AlreadySplit` and `NoCrop` returns renumber first.
pub struct PageSplitManager<S> {
    store: S,
    locks: Mutex<HashMap<BookId, Arc<Mutex<()>>>>,
}

impl<S: PageStore> PageSplitManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `op` holding the book's lock. The lock entry is dropped again once
    /// no other caller holds or waits on it.
    fn with_book<T>(
        &self,
        book_id: &BookId,
        op: impl FnOnce() -> Result<T, PageError>,
    ) -> Result<T, PageError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(book_id.clone()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op()
        };
        drop(lock);

        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(book_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(book_id);
        }
        result
    }

    fn load(&self, page_id: &PageId) -> Result<Page, PageError> {
        self.store
            .find_page(page_id)?
            .ok_or_else(|| PageError::NotFound(page_id.clone()))
    }

    pub fn apply_split(
        &self,
        page_id: &PageId,
        decision: CropDecision,
    ) -> Result<SplitOutcome, PageError> {
        let (left, right) = decision.regions()?;
        let book_id = self.load(page_id)?.book_id;

        self.with_book(&book_id, || {
            // re-read under the lock; a concurrent split may have moved it
            let page = self.load(page_id)?;
            if page.is_split() {
                self.renumber_locked(&book_id)?;
                return Err(PageError::AlreadySplit(page.id));
            }
            if page.image_url.is_none() {
                return Err(PageError::NoImage(page.id));
            }

            let sibling = NewPage {
                book_id: page.book_id.clone(),
                page_number: page.page_number,
                image_url: page.image_url.clone(),
                kind: PageKind::SplitRight {
                    crop: right,
                    parent: page.id.clone(),
                },
            };
            let sibling = self.store.commit_split(&page.id, left, sibling)?;
            let renumbered_count = self.renumber_locked(&book_id)?;

            let updated_page = self.load(&page.id)?;
            let new_sibling = self.load(&sibling.id)?;
            info!(
                book = %book_id,
                page = %updated_page.id,
                sibling = %new_sibling.id,
                left_end = left.x_end(),
                right_start = right.x_start(),
                renumbered_count,
                "page split applied"
            );

            Ok(SplitOutcome {
                updated_page,
                new_sibling,
                renumbered_count,
            })
        })
    }

    /// Applies a detector verdict only when it is safe without review. `None`
    /// means the page should be queued for confirmation.
    pub fn apply_detected(
        &self,
        page_id: &PageId,
        result: &DetectionResult,
    ) -> Result<Option<SplitOutcome>, PageError> {
        if !result.should_auto_apply() {
            debug!(
                page = %page_id,
                confidence = result.confidence.as_str(),
                has_text = result.has_text_at_split,
                "detection needs review, split not applied"
            );
            return Ok(None);
        }
        self.apply_split(page_id, CropDecision::Detected(*result))
            .map(Some)
    }

    /// Reverses a split given either half.
    pub fn undo_split(&self, page_id: &PageId) -> Result<UndoOutcome, PageError> {
        let book_id = self.load(page_id)?.book_id;

        self.with_book(&book_id, || {
            let page = self.load(page_id)?;
            let (original, sibling_id) = match page.kind.clone() {
                PageKind::SplitRight { parent, .. } => (self.load(&parent)?, Some(page.id)),
                PageKind::Original { crop: None } => {
                    self.renumber_locked(&book_id)?;
                    return Err(PageError::NoCrop(page.id));
                }
                PageKind::Original { crop: Some(_) } => {
                    let child = self.store.find_split_child(&page.id)?;
                    (page, child.map(|child| child.id))
                }
            };

            self.store
                .commit_unsplit(&original.id, sibling_id.as_ref())?;
            let renumbered_count = self.renumber_locked(&book_id)?;
            let original_page = self.load(&original.id)?;

            info!(
                book = %book_id,
                page = %original_page.id,
                sibling = ?sibling_id.as_ref().map(PageId::as_str),
                renumbered_count,
                "page split undone"
            );

            Ok(UndoOutcome {
                original_page,
                deleted_sibling_id: sibling_id,
                renumbered_count,
            })
        })
    }

    /// Restores `1..=N` numbering for the book. Returns how many pages moved.
    pub fn renumber(&self, book_id: &BookId) -> Result<usize, PageError> {
        self.with_book(book_id, || self.renumber_locked(book_id))
    }

    fn renumber_locked(&self, book_id: &BookId) -> Result<usize, PageError> {
        let mut pages = self.store.pages_for_book(book_id)?;
        pages.sort_by(|a, b| {
            (a.page_number, a.is_split_right(), &a.id).cmp(&(b.page_number, b.is_split_right(), &b.id))
        });

        // right halves follow their parent; orphans keep their own slot
        let originals: HashSet<&PageId> = pages
            .iter()
            .filter(|page| !page.is_split_right())
            .map(|page| &page.id)
            .collect();
        let mut halves: HashMap<&PageId, Vec<&Page>> = HashMap::new();
        for page in &pages {
            if let PageKind::SplitRight { parent, .. } = &page.kind {
                if originals.contains(parent) {
                    halves.entry(parent).or_default().push(page);
                }
            }
        }

        let mut ordered: Vec<&Page> = Vec::with_capacity(pages.len());
        for page in &pages {
            match &page.kind {
                PageKind::SplitRight { parent, .. } if originals.contains(parent) => {}
                PageKind::SplitRight { .. } => ordered.push(page),
                PageKind::Original { .. } => {
                    ordered.push(page);
                    if let Some(right) = halves.get(&page.id) {
                        ordered.extend(right.iter().copied());
                    }
                }
            }
        }

        let changes: Vec<(PageId, u32)> = ordered
            .iter()
            .zip(1u32..)
            .filter(|(page, number)| page.page_number != *number)
            .map(|(page, number)| (page.id.clone(), number))
            .collect();

        if !changes.is_empty() {
            self.store.bulk_renumber(&changes)?;
        }
        debug!(book = %book_id, pages = pages.len(), changed = changes.len(), "book renumbered");
        Ok(changes.len())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::test_support::*;
    use super::*;
    use crate::doublepage::{Confidence, DetectionResult};

    /// In-memory store whose next `failures` renumber writes are rejected.
    #[derive(Default)]
    struct FlakyRenumberStore {
        inner: InMemoryPageStore,
        failures: AtomicUsize,
    }

    impl FlakyRenumberStore {
        fn fail_next_renumber(&self) {
            self.failures.store(1, Ordering::SeqCst);
        }
    }

    impl PageStore for FlakyRenumberStore {
        fn insert_page(&self, page: NewPage) -> Result<Page, StoreError> {
            self.inner.insert_page(page)
        }

        fn find_page(&self, id: &PageId) -> Result<Option<Page>, StoreError> {
            self.inner.find_page(id)
        }

        fn pages_for_book(&self, book_id: &BookId) -> Result<Vec<Page>, StoreError> {
            self.inner.pages_for_book(book_id)
        }

        fn find_split_child(&self, parent: &PageId) -> Result<Option<Page>, StoreError> {
            self.inner.find_split_child(parent)
        }

        fn commit_split(
            &self,
            original: &PageId,
            left: Crop,
            sibling: NewPage,
        ) -> Result<Page, StoreError> {
            self.inner.commit_split(original, left, sibling)
        }

        fn commit_unsplit(&self, original: &PageId, sibling: Option<&PageId>) -> Result<(), StoreError> {
            self.inner.commit_unsplit(original, sibling)
        }

        fn bulk_renumber(&self, changes: &[(PageId, u32)]) -> Result<(), StoreError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Poisoned);
            }
            self.inner.bulk_renumber(changes)
        }
    }

    fn manager() -> PageSplitManager<InMemoryPageStore> {
        PageSplitManager::new(InMemoryPageStore::new())
    }

    fn spread_at(split_position: u16, confidence: Confidence, has_text: bool) -> DetectionResult {
        let mut result = DetectionResult::single_page(1.5);
        result.is_two_page_spread = true;
        result.split_position = split_position;
        result.split_percent = split_position as f64 / 10.0;
        result.confidence = confidence;
        result.has_text_at_split = has_text;
        result
    }

    #[test]
    fn crop_rejects_empty_and_out_of_scale_regions() {
        assert!(Crop::new(0, 1000).is_ok());
        assert!(matches!(Crop::new(500, 500), Err(PageError::InvalidCrop(_))));
        assert!(matches!(Crop::new(600, 400), Err(PageError::InvalidCrop(_))));
        assert!(matches!(Crop::new(0, 1001), Err(PageError::InvalidCrop(_))));
        assert!(Crop::halves(0).is_err());
        assert!(Crop::halves(1000).is_err());
    }

    #[test]
    fn crop_deserialization_validates() {
        let crop: Crop = serde_json::from_str(r#"{"xStart": 10, "xEnd": 20}"#).expect("crop");
        assert_eq!((crop.x_start(), crop.x_end()), (10, 20));
        assert!(serde_json::from_str::<Crop>(r#"{"xStart": 20, "xEnd": 10}"#).is_err());
    }

    #[test]
    fn legacy_percent_derives_halves() {
        let (left, right) = CropDecision::Percent(48.26).regions().expect("regions");
        assert_eq!((left.x_start(), left.x_end()), (0, 483));
        assert_eq!((right.x_start(), right.x_end()), (483, 1000));
        assert!(CropDecision::Percent(0.0).regions().is_err());
        assert!(CropDecision::Percent(100.0).regions().is_err());
        assert!(CropDecision::Percent(f64::NAN).regions().is_err());
    }

    #[test]
    fn record_with_parent_but_no_crop_is_corrupt() {
        let record = PageRecord {
            id: PageId::new("b"),
            book_id: BookId::new("book"),
            page_number: 2,
            image_url: None,
            crop: None,
            split_from: Some(PageId::new("a")),
        };
        assert!(matches!(Page::try_from(record), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn split_inserts_sibling_after_original() {
        let manager = manager();
        let pages = seed_book(manager.store(), "book", 10);
        let fifth = pages[4].id.clone();

        let outcome = manager
            .apply_split(&fifth, CropDecision::Detected(spread_at(500, Confidence::High, false)))
            .expect("split");

        assert_eq!(outcome.updated_page.page_number, 5);
        assert_eq!(outcome.updated_page.crop(), Some(Crop::new(0, 500).expect("crop")));
        assert_eq!(outcome.new_sibling.page_number, 6);
        assert_eq!(
            outcome.new_sibling.kind,
            PageKind::SplitRight {
                crop: Crop::new(500, 1000).expect("crop"),
                parent: fifth.clone(),
            }
        );
        assert_eq!(outcome.new_sibling.image_url, pages[4].image_url);
        assert_eq!(outcome.renumbered_count, 6);
        assert_eq!(numbers(manager.store(), "book"), (1..=11).collect::<Vec<_>>());

        let sixth = manager.store().find_page(&pages[5].id).expect("find").expect("page");
        assert_eq!(sixth.page_number, 7);
    }

    #[test]
    fn undo_restores_original_from_either_half() {
        for undo_from_sibling in [false, true] {
            let manager = manager();
            let pages = seed_book(manager.store(), "book", 10);
            let before = manager.store().pages_for_book(&BookId::new("book")).expect("pages");

            let split = manager
                .apply_split(&pages[4].id, CropDecision::Percent(50.0))
                .expect("split");
            let target = if undo_from_sibling {
                split.new_sibling.id.clone()
            } else {
                split.updated_page.id.clone()
            };

            let undo = manager.undo_split(&target).expect("undo");
            assert_eq!(undo.original_page.id, pages[4].id);
            assert_eq!(undo.original_page.kind, PageKind::Original { crop: None });
            assert_eq!(undo.deleted_sibling_id, Some(split.new_sibling.id.clone()));
            assert_eq!(undo.renumbered_count, 5);

            let mut after = manager.store().pages_for_book(&BookId::new("book")).expect("pages");
            let mut before = before.clone();
            after.sort_by(|a, b| a.id.cmp(&b.id));
            before.sort_by(|a, b| a.id.cmp(&b.id));
            assert_eq!(after, before);
        }
    }

    #[test]
    fn invalid_state_transitions_are_rejected() {
        let manager = manager();
        let pages = seed_book(manager.store(), "book", 3);

        assert!(matches!(
            manager.undo_split(&pages[0].id),
            Err(PageError::NoCrop(_))
        ));
        assert!(matches!(
            manager.apply_split(&PageId::new("missing"), CropDecision::Percent(50.0)),
            Err(PageError::NotFound(_))
        ));
        assert!(matches!(
            manager.apply_split(
                &pages[0].id,
                CropDecision::Detected(DetectionResult::single_page(0.7))
            ),
            Err(PageError::NotASpread)
        ));

        let split = manager
            .apply_split(&pages[0].id, CropDecision::Percent(40.0))
            .expect("split");
        assert!(matches!(
            manager.apply_split(&pages[0].id, CropDecision::Percent(40.0)),
            Err(PageError::AlreadySplit(_))
        ));
        assert!(matches!(
            manager.apply_split(&split.new_sibling.id, CropDecision::Percent(40.0)),
            Err(PageError::AlreadySplit(_))
        ));
    }

    #[test]
    fn page_without_image_cannot_be_split() {
        let manager = manager();
        let page = manager
            .store()
            .insert_page(NewPage {
                book_id: BookId::new("book"),
                page_number: 1,
                image_url: None,
                kind: PageKind::Original { crop: None },
            })
            .expect("insert");
        assert!(matches!(
            manager.apply_split(&page.id, CropDecision::Percent(50.0)),
            Err(PageError::NoImage(_))
        ));
    }

    #[test]
    fn undo_of_orphaned_crop_clears_it() {
        let manager = manager();
        let page = manager
            .store()
            .insert_page(NewPage {
                book_id: BookId::new("book"),
                page_number: 1,
                image_url: Some("https://cdn.example.com/1.jpg".into()),
                kind: PageKind::Original {
                    crop: Some(Crop::new(0, 500).expect("crop")),
                },
            })
            .expect("insert");

        let undo = manager.undo_split(&page.id).expect("undo");
        assert_eq!(undo.deleted_sibling_id, None);
        assert_eq!(undo.original_page.crop(), None);
    }

    #[test]
    fn auto_apply_only_takes_confident_clean_splits() {
        let manager = manager();
        let pages = seed_book(manager.store(), "book", 4);

        let review = manager
            .apply_detected(&pages[0].id, &spread_at(500, Confidence::Medium, false))
            .expect("medium");
        assert!(review.is_none());
        let review = manager
            .apply_detected(&pages[0].id, &spread_at(500, Confidence::High, true))
            .expect("text");
        assert!(review.is_none());
        assert_eq!(numbers(manager.store(), "book"), vec![1, 2, 3, 4]);

        let applied = manager
            .apply_detected(&pages[0].id, &spread_at(510, Confidence::High, false))
            .expect("high")
            .expect("applied");
        assert_eq!(applied.new_sibling.crop().map(|c| c.x_start()), Some(510));
    }

    #[test]
    fn vision_regions_become_crop_decision() {
        let manager = manager();
        let pages = seed_book(manager.store(), "book", 2);
        let regions = VisionRegions {
            left: Crop::new(30, 480).expect("crop"),
            right: Crop::new(520, 970).expect("crop"),
        };

        let outcome = manager
            .apply_split(&pages[1].id, regions.into())
            .expect("split");
        assert_eq!(outcome.updated_page.crop(), Some(regions.left));
        assert_eq!(outcome.new_sibling.crop(), Some(regions.right));
        assert_eq!(outcome.new_sibling.page_number, 3);
        assert_eq!(outcome.renumbered_count, 1);
    }

    #[test]
    fn renumber_heals_gaps_and_is_idempotent() {
        let manager = manager();
        let pages = seed_book(manager.store(), "book", 4);
        manager
            .store()
            .bulk_renumber(&[(pages[2].id.clone(), 7), (pages[3].id.clone(), 12)])
            .expect("scramble");

        assert_eq!(manager.renumber(&BookId::new("book")).expect("renumber"), 2);
        assert_eq!(numbers(manager.store(), "book"), vec![1, 2, 3, 4]);
        assert_eq!(manager.renumber(&BookId::new("book")).expect("again"), 0);
    }

    #[test]
    fn concurrent_splits_on_one_book_keep_numbering_dense() {
        let manager = manager();
        let pages = seed_book(manager.store(), "book", 10);

        std::thread::scope(|scope| {
            for page in pages.iter().take(5) {
                let manager = &manager;
                scope.spawn(move || {
                    manager
                        .apply_split(&page.id, CropDecision::Percent(50.0))
                        .expect("split");
                });
            }
        });

        assert_eq!(numbers(manager.store(), "book"), (1..=15).collect::<Vec<_>>());
        assert!(manager.locks.lock().expect("locks").is_empty());
        for page in pages.iter().take(5) {
            let original = manager.store().find_page(&page.id).expect("find").expect("page");
            let sibling = manager
                .store()
                .find_split_child(&page.id)
                .expect("child")
                .expect("sibling");
            assert_eq!(sibling.page_number, original.page_number + 1);
        }
    }

    #[test]
    fn books_are_independent() {
        let manager = manager();
        let a = seed_book(manager.store(), "a", 3);
        seed_book(manager.store(), "b", 3);

        manager
            .apply_split(&a[0].id, CropDecision::Percent(50.0))
            .expect("split");
        assert_eq!(numbers(manager.store(), "a"), vec![1, 2, 3, 4]);
        assert_eq!(numbers(manager.store(), "b"), vec![1, 2, 3]);
    }

    #[test]
    fn single_page_book_splits_and_undoes() {
        let manager = manager();
        let pages = seed_book(manager.store(), "solo", 1);

        let split = manager
            .apply_split(&pages[0].id, CropDecision::Percent(50.0))
            .expect("split");
        assert_eq!(split.updated_page.page_number, 1);
        assert_eq!(split.new_sibling.page_number, 2);
        assert_eq!(split.renumbered_count, 1);
        assert_eq!(numbers(manager.store(), "solo"), vec![1, 2]);

        let undo = manager.undo_split(&split.new_sibling.id).expect("undo");
        assert_eq!(undo.renumbered_count, 0);
        assert_eq!(numbers(manager.store(), "solo"), vec![1]);
    }

    #[test]
    fn retried_split_heals_numbering_after_failed_renumber() {
        let manager = PageSplitManager::new(FlakyRenumberStore::default());
        let pages = seed_book(manager.store(), "book", 10);
        manager.store().fail_next_renumber();

        assert!(matches!(
            manager.apply_split(&pages[4].id, CropDecision::Percent(50.0)),
            Err(PageError::Store(StoreError::Poisoned))
        ));
        assert_eq!(
            numbers(manager.store(), "book"),
            vec![1, 2, 3, 4, 5, 5, 6, 7, 8, 9, 10]
        );

        assert!(matches!(
            manager.apply_split(&pages[4].id, CropDecision::Percent(50.0)),
            Err(PageError::AlreadySplit(_))
        ));
        assert_eq!(numbers(manager.store(), "book"), (1..=11).collect::<Vec<_>>());
        let sibling = manager
            .store()
            .find_split_child(&pages[4].id)
            .expect("child")
            .expect("sibling");
        assert_eq!(sibling.page_number, 6);
    }

    #[test]
    fn retried_undo_heals_numbering_after_failed_renumber() {
        let manager = PageSplitManager::new(FlakyRenumberStore::default());
        let pages = seed_book(manager.store(), "book", 10);
        manager
            .apply_split(&pages[4].id, CropDecision::Percent(50.0))
            .expect("split");
        manager.store().fail_next_renumber();

        assert!(matches!(
            manager.undo_split(&pages[4].id),
            Err(PageError::Store(StoreError::Poisoned))
        ));
        assert_eq!(
            numbers(manager.store(), "book"),
            vec![1, 2, 3, 4, 5, 7, 8, 9, 10, 11]
        );

        assert!(matches!(
            manager.undo_split(&pages[4].id),
            Err(PageError::NoCrop(_))
        ));
        assert_eq!(numbers(manager.store(), "book"), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn renumber_keeps_right_half_after_parent_among_duplicates() {
        let manager = manager();
        let pages = seed_book(manager.store(), "book", 3);
        manager
            .store()
            .bulk_renumber(&[(pages[2].id.clone(), 2)])
            .expect("duplicate");
        let right = manager
            .store()
            .commit_split(
                &pages[1].id,
                Crop::new(0, 500).expect("crop"),
                NewPage {
                    book_id: BookId::new("book"),
                    page_number: 2,
                    image_url: pages[1].image_url.clone(),
                    kind: PageKind::SplitRight {
                        crop: Crop::new(500, 1000).expect("crop"),
                        parent: pages[1].id.clone(),
                    },
                },
            )
            .expect("commit split");

        assert_eq!(manager.renumber(&BookId::new("book")).expect("renumber"), 2);
        let number_of = |id: &PageId| {
            manager
                .store()
                .find_page(id)
                .expect("find")
                .expect("page")
                .page_number
        };
        assert_eq!(number_of(&pages[1].id), 2);
        assert_eq!(number_of(&right.id), 3);
        assert_eq!(number_of(&pages[2].id), 4);
    }

    #[test]
    fn book_locks_are_released_after_use() {
        let manager = manager();
        let a = seed_book(manager.store(), "a", 2);
        seed_book(manager.store(), "b", 2);

        let split = manager
            .apply_split(&a[0].id, CropDecision::Percent(50.0))
            .expect("split");
        manager.undo_split(&split.new_sibling.id).expect("undo");
        manager.renumber(&BookId::new("b")).expect("renumber");
        assert!(manager.undo_split(&a[1].id).is_err());

        assert!(manager.locks.lock().expect("locks").is_empty());
    }
}
