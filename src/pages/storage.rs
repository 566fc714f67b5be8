use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use super::{BookId, Crop, Page, PageId, PageKind, PageRecord};

#[cfg(feature = "page-sqlite")]
use rusqlite::OptionalExtension;
#[cfg(feature = "page-sqlite")]
use std::path::PathBuf;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page {0} is missing from the store")]
    Missing(PageId),
    #[error("stored page is inconsistent: {0}")]
    Corrupt(String),
    #[error("page store lock poisoned")]
    Poisoned,
    #[cfg(feature = "page-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A page that has not been given an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPage {
    pub book_id: BookId,
    pub page_number: u32,
    pub image_url: Option<String>,
    pub kind: PageKind,
}

impl NewPage {
    fn into_page(self, id: PageId) -> Page {
        Page {
            id,
            book_id: self.book_id,
            page_number: self.page_number,
            image_url: self.image_url,
            kind: self.kind,
        }
    }
}

pub trait PageStore: Send + Sync {
    fn insert_page(&self, page: NewPage) -> Result<Page, StoreError>;
    fn find_page(&self, id: &PageId) -> Result<Option<Page>, StoreError>;
    fn pages_for_book(&self, book_id: &BookId) -> Result<Vec<Page>, StoreError>;
    fn find_split_child(&self, parent: &PageId) -> Result<Option<Page>, StoreError>;
    /// Sets the left crop on `original` and inserts `sibling` as one unit.
    fn commit_split(
        &self,
        original: &PageId,
        left: Crop,
        sibling: NewPage,
    ) -> Result<Page, StoreError>;
    /// Deletes `sibling` (if any) and clears the crop on `original` as one unit.
    fn commit_unsplit(&self, original: &PageId, sibling: Option<&PageId>) -> Result<(), StoreError>;
    fn bulk_renumber(&self, changes: &[(PageId, u32)]) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryPageStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    seq: u64,
    rows: HashMap<PageId, PageRecord>,
}

impl StoreInner {
    fn next_id(&mut self) -> PageId {
        self.seq += 1;
        PageId::new(format!("pg-{}", self.seq))
    }

    fn insert(&mut self, page: NewPage) -> Page {
        let id = self.next_id();
        let page = page.into_page(id);
        self.rows.insert(page.id.clone(), PageRecord::from(&page));
        page
    }
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, StoreInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl PageStore for InMemoryPageStore {
    fn insert_page(&self, page: NewPage) -> Result<Page, StoreError> {
        Ok(self.guard()?.insert(page))
    }

    fn find_page(&self, id: &PageId) -> Result<Option<Page>, StoreError> {
        self.guard()?
            .rows
            .get(id)
            .cloned()
            .map(Page::try_from)
            .transpose()
    }

    fn pages_for_book(&self, book_id: &BookId) -> Result<Vec<Page>, StoreError> {
        let guard = self.guard()?;
        let mut pages = guard
            .rows
            .values()
            .filter(|row| &row.book_id == book_id)
            .cloned()
            .map(Page::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        pages.sort_by(|a, b| (a.page_number, &a.id).cmp(&(b.page_number, &b.id)));
        Ok(pages)
    }

    fn find_split_child(&self, parent: &PageId) -> Result<Option<Page>, StoreError> {
        self.guard()?
            .rows
            .values()
            .find(|row| row.split_from.as_ref() == Some(parent))
            .cloned()
            .map(Page::try_from)
            .transpose()
    }

    fn commit_split(
        &self,
        original: &PageId,
        left: Crop,
        sibling: NewPage,
    ) -> Result<Page, StoreError> {
        let mut guard = self.guard()?;
        let row = guard
            .rows
            .get_mut(original)
            .ok_or_else(|| StoreError::Missing(original.clone()))?;
        row.crop = Some(left);
        Ok(guard.insert(sibling))
    }

    fn commit_unsplit(&self, original: &PageId, sibling: Option<&PageId>) -> Result<(), StoreError> {
        let mut guard = self.guard()?;
        if !guard.rows.contains_key(original) {
            return Err(StoreError::Missing(original.clone()));
        }
        if let Some(sibling) = sibling {
            guard.rows.remove(sibling);
        }
        if let Some(row) = guard.rows.get_mut(original) {
            row.crop = None;
            row.split_from = None;
        }
        Ok(())
    }

    fn bulk_renumber(&self, changes: &[(PageId, u32)]) -> Result<(), StoreError> {
        let mut guard = self.guard()?;
        if let Some((missing, _)) = changes.iter().find(|(id, _)| !guard.rows.contains_key(id)) {
            return Err(StoreError::Missing(missing.clone()));
        }
        for (id, number) in changes {
            if let Some(row) = guard.rows.get_mut(id) {
                row.page_number = *number;
            }
        }
        Ok(())
    }
}

// -----------------------------
// SQLite-backed PageStore
// -----------------------------

#[cfg(feature = "page-sqlite")]
const PAGE_COLUMNS: &str = "id, book_id, page_number, image_url, crop_start, crop_end, split_from";

#[cfg(feature = "page-sqlite")]
pub struct SqlitePageStore {
    db_path: PathBuf,
}

#[cfg(feature = "page-sqlite")]
struct SqlRow {
    id: String,
    book_id: String,
    page_number: u32,
    image_url: Option<String>,
    crop_start: Option<u16>,
    crop_end: Option<u16>,
    split_from: Option<String>,
}

#[cfg(feature = "page-sqlite")]
impl SqlRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            book_id: row.get(1)?,
            page_number: row.get(2)?,
            image_url: row.get(3)?,
            crop_start: row.get(4)?,
            crop_end: row.get(5)?,
            split_from: row.get(6)?,
        })
    }

    fn into_page(self) -> Result<Page, StoreError> {
        let crop = match (self.crop_start, self.crop_end) {
            (Some(start), Some(end)) => Some(
                Crop::new(start, end).map_err(|err| StoreError::Corrupt(err.to_string()))?,
            ),
            (None, None) => None,
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "page {} has a half-set crop",
                    self.id
                )))
            }
        };
        Page::try_from(PageRecord {
            id: PageId::new(self.id),
            book_id: BookId::new(self.book_id),
            page_number: self.page_number,
            image_url: self.image_url,
            crop,
            split_from: self.split_from.map(PageId::new),
        })
    }
}

#[cfg(feature = "page-sqlite")]
impl SqlitePageStore {
    /// Opens (and if needed creates) the `pages` table at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            db_path: db_path.into(),
        };
        store.connect()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS pages (
                 id TEXT PRIMARY KEY,
                 book_id TEXT NOT NULL,
                 page_number INTEGER NOT NULL,
                 image_url TEXT,
                 crop_start INTEGER,
                 crop_end INTEGER,
                 split_from TEXT
             );
             CREATE INDEX IF NOT EXISTS pages_book_idx ON pages (book_id, page_number);
             CREATE INDEX IF NOT EXISTS pages_split_from_idx ON pages (split_from);",
        )?;
        Ok(store)
    }

    fn connect(&self) -> Result<rusqlite::Connection, StoreError> {
        Ok(rusqlite::Connection::open(&self.db_path)?)
    }

    fn insert_with(conn: &rusqlite::Connection, page: NewPage) -> Result<Page, StoreError> {
        let (crop, split_from) = match &page.kind {
            PageKind::Original { crop } => (*crop, None),
            PageKind::SplitRight { crop, parent } => (Some(*crop), Some(parent.as_str())),
        };
        let id: String = conn.query_row(
            "INSERT INTO pages (id, book_id, page_number, image_url, crop_start, crop_end, split_from)
             VALUES (lower(hex(randomblob(16))), ?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING id",
            rusqlite::params![
                page.book_id.as_str(),
                page.page_number,
                page.image_url.as_deref(),
                crop.map(|c| c.x_start()),
                crop.map(|c| c.x_end()),
                split_from,
            ],
            |row| row.get(0),
        )?;
        Ok(page.into_page(PageId::new(id)))
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<Page>, StoreError> {
        let conn = self.connect()?;
        let row = conn.query_row(sql, [key], SqlRow::read).optional()?;
        row.map(SqlRow::into_page).transpose()
    }
}

#[cfg(feature = "page-sqlite")]
impl PageStore for SqlitePageStore {
    fn insert_page(&self, page: NewPage) -> Result<Page, StoreError> {
        let conn = self.connect()?;
        Self::insert_with(&conn, page)
    }

    fn find_page(&self, id: &PageId) -> Result<Option<Page>, StoreError> {
        self.query_one(
            &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?1"),
            id.as_str(),
        )
    }

    fn pages_for_book(&self, book_id: &BookId) -> Result<Vec<Page>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE book_id = ?1 ORDER BY page_number, id"
        ))?;
        let rows = stmt
            .query_map([book_id.as_str()], SqlRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SqlRow::into_page).collect()
    }

    fn find_split_child(&self, parent: &PageId) -> Result<Option<Page>, StoreError> {
        self.query_one(
            &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE split_from = ?1 LIMIT 1"),
            parent.as_str(),
        )
    }

    fn commit_split(
        &self,
        original: &PageId,
        left: Crop,
        sibling: NewPage,
    ) -> Result<Page, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE pages SET crop_start = ?2, crop_end = ?3 WHERE id = ?1",
            rusqlite::params![original.as_str(), left.x_start(), left.x_end()],
        )?;
        if updated == 0 {
            return Err(StoreError::Missing(original.clone()));
        }
        let page = Self::insert_with(&tx, sibling)?;
        tx.commit()?;
        Ok(page)
    }

    fn commit_unsplit(&self, original: &PageId, sibling: Option<&PageId>) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        if let Some(sibling) = sibling {
            tx.execute("DELETE FROM pages WHERE id = ?1", [sibling.as_str()])?;
        }
        let updated = tx.execute(
            "UPDATE pages SET crop_start = NULL, crop_end = NULL, split_from = NULL WHERE id = ?1",
            [original.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::Missing(original.clone()));
        }
        tx.commit()?;
        Ok(())
    }

    fn bulk_renumber(&self, changes: &[(PageId, u32)]) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE pages SET page_number = ?2 WHERE id = ?1")?;
            for (id, number) in changes {
                if stmt.execute(rusqlite::params![id.as_str(), number])? == 0 {
                    return Err(StoreError::Missing(id.clone()));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
