use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{CryptoProvider, Options};
use crate::error::DbError;
use crate::types::{DbResult, PageId, TxnId, MAX_PAGE_ID};
use crate::utils::{ByteReader, ByteWriter, DbFile};

pub const HEADER_EXTRA_LEN: usize = 44;

const HEADER_MAGIC: u64 = 0xa59e_17db_0c0a_7b11;
const ENCODING_VERSION: u32 = 1;

// magic(8) version(4) pageSize(4) activeFlag(1) pad(3) commitCounter(8)
// extra(44) checksum(8)
const HEADER_LEN: usize = 80;
const HEADER_CHECKSUM_OFFSET: usize = HEADER_LEN - 8;

/// The first page index the allocator may hand out. Indexes 0 and 1 hold the
/// two commit headers.
pub const FIRST_USABLE_PAGE: PageId = 2;

/// The caller-owned payload of the commit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitExtra {
    pub encoding_version: u32,
    pub root_page_id: PageId,
    pub master_undo_page_id: PageId,
    pub transaction_id: TxnId,
    pub redo_position: u64,
    pub redo_txn_id: TxnId,
}

impl CommitExtra {
    pub fn encode(&self) -> [u8; HEADER_EXTRA_LEN] {
        let mut w = ByteWriter::with_capacity(HEADER_EXTRA_LEN);
        w.write_u32(self.encoding_version);
        w.write_u64(self.root_page_id);
        w.write_u64(self.master_undo_page_id);
        w.write_u64(self.transaction_id);
        w.write_u64(self.redo_position);
        w.write_u64(self.redo_txn_id);
        let v = w.into_vec();
        let mut out = [0u8; HEADER_EXTRA_LEN];
        out.copy_from_slice(&v);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DbError> {
        let mut r = ByteReader::new(buf);
        Ok(Self {
            encoding_version: r.read_u32()?,
            root_page_id: r.read_u64()?,
            master_undo_page_id: r.read_u64()?,
            transaction_id: r.read_u64()?,
            redo_position: r.read_u64()?,
            redo_txn_id: r.read_u64()?,
        })
    }
}

struct HeaderState {
    commit_counter: u64,
    active_slot: u8,
    extra: CommitExtra,
}

/// Fixed-size page I/O over the base file, plus the two-header commit
/// protocol and the commit lock.
///
/// Mutators hold the commit lock shared for the duration of any structural
/// change; the checkpointer takes it exclusive to quiesce for the color flip.
pub struct PageStore {
    file: DbFile,
    page_size: usize,
    read_only: bool,
    crypto: Option<Arc<dyn CryptoProvider>>,
    commit_lock: RwLock<()>,
    state: Mutex<HeaderState>,
    /// One past the highest page index backed by the file.
    page_count: AtomicU64,
    // Held for the lifetime of the store; dropping releases the OS lock.
    _lock_file: std::fs::File,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("page_size", &self.page_size)
            .field("read_only", &self.read_only)
            .field("page_count", &self.page_count)
            .finish()
    }
}

impl PageStore {
    /// Open or create the page file. Returns the store and whether the file
    /// was freshly created.
    pub fn open(opts: &Options) -> Result<(Self, bool), DbError> {
        let base = &opts.base_file_path;
        if opts.mkdirs && !opts.read_only {
            if let Some(parent) = base.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| DbError::io("creating database directories", e))?;
                }
            }
        }

        let lock_file = Self::acquire_lock_file(&lock_file_path(base))?;

        let file = DbFile::open(base, !opts.read_only, opts.read_only)?;
        let len = file.len()?;
        let created = len == 0;
        if created && opts.read_only {
            return Err(DbError::Config(
                "cannot create a database in read-only mode".to_string(),
            ));
        }

        let mut store = Self {
            file,
            page_size: opts.page_size,
            read_only: opts.read_only,
            crypto: opts.crypto.clone(),
            commit_lock: RwLock::new(()),
            state: Mutex::new(HeaderState {
                commit_counter: 0,
                active_slot: 0,
                extra: CommitExtra {
                    encoding_version: ENCODING_VERSION,
                    ..CommitExtra::default()
                },
            }),
            page_count: AtomicU64::new(FIRST_USABLE_PAGE),
            _lock_file: lock_file,
        };

        if created {
            store.format()?;
            info!("created page file {:?}, page size {}", base, store.page_size);
        } else {
            store.load_headers(len)?;
        }
        Ok((store, created))
    }

    fn acquire_lock_file(path: &Path) -> Result<std::fs::File, DbError> {
        use fs4::fs_std::FileExt;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| DbError::io("opening the lock file", e))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            DbError::Config(format!(
                "database is already open in another process ({:?})",
                path
            ))
        })?;
        Ok(lock_file)
    }

    /// Initialize a fresh file: both header slots written, slot 0 active.
    fn format(&mut self) -> DbResult {
        let state = HeaderState {
            commit_counter: 1,
            active_slot: 0,
            extra: CommitExtra {
                encoding_version: ENCODING_VERSION,
                ..CommitExtra::default()
            },
        };
        let header = self.encode_header(&state, true);
        self.file.write_at(0, &header)?;
        // The inactive slot is zeroed so a torn first commit is detectable.
        self.file
            .write_at(self.page_size as u64, &vec![0u8; HEADER_LEN])?;
        self.file.sync_all()?;
        *self.state.lock().unwrap() = state;
        Ok(())
    }

    fn load_headers(&mut self, file_len: u64) -> DbResult {
        let slot0 = self.read_header_slot(0)?;
        let slot1 = self.read_header_slot(1)?;
        let state = match (slot0, slot1) {
            (Some(a), Some(b)) => {
                if a.commit_counter >= b.commit_counter {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(DbError::corrupt(
                    "neither commit header is valid".to_string(),
                ))
            }
        };
        debug!(
            "loaded header: slot {}, commit counter {}, extra {:?}",
            state.active_slot, state.commit_counter, state.extra
        );
        let pages = (file_len + self.page_size as u64 - 1) / self.page_size as u64;
        self.page_count
            .store(pages.max(FIRST_USABLE_PAGE), Ordering::SeqCst);
        *self.state.lock().unwrap() = state;
        Ok(())
    }

    fn read_header_slot(&self, slot: u8) -> Result<Option<HeaderState>, DbError> {
        let offset = slot as u64 * self.page_size as u64;
        let mut buf = vec![0u8; HEADER_LEN];
        if self.file.read_at(offset, &mut buf).is_err() {
            return Ok(None);
        }

        let stored_sum = {
            let mut r = ByteReader::new(&buf[HEADER_CHECKSUM_OFFSET..]);
            r.read_u64()?
        };
        if xxh3_64(&buf[..HEADER_CHECKSUM_OFFSET]) != stored_sum {
            return Ok(None);
        }

        let mut r = ByteReader::new(&buf);
        let magic = r.read_u64()?;
        if magic != HEADER_MAGIC {
            return Err(DbError::corrupt(format!(
                "bad header magic: {:#018x}",
                magic
            )));
        }
        let version = r.read_u32()?;
        if version != ENCODING_VERSION {
            return Err(DbError::corrupt(format!(
                "unsupported encoding version {}",
                version
            )));
        }
        let page_size = r.read_u32()? as usize;
        if page_size != self.page_size {
            return Err(DbError::Config(format!(
                "file page size is {}, configured {}",
                page_size, self.page_size
            )));
        }
        let _active_flag = r.read_u8()?;
        r.read_raw(3)?;
        let commit_counter = r.read_u64()?;
        let extra = CommitExtra::decode(r.read_raw(HEADER_EXTRA_LEN)?)?;
        Ok(Some(HeaderState {
            commit_counter,
            active_slot: slot,
            extra,
        }))
    }

    fn encode_header(&self, state: &HeaderState, active: bool) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(HEADER_LEN);
        w.write_u64(HEADER_MAGIC);
        w.write_u32(ENCODING_VERSION);
        w.write_u32(self.page_size as u32);
        w.write_u8(active as u8);
        w.write_raw(&[0u8; 3]);
        w.write_u64(state.commit_counter);
        w.write_raw(&state.extra.encode());
        let mut buf = w.into_vec();
        let sum = xxh3_64(&buf);
        let mut w = ByteWriter::with_capacity(8);
        w.write_u64(sum);
        buf.extend_from_slice(w.as_slice());
        buf
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    fn check_page_id(&self, id: PageId) -> DbResult {
        if id < FIRST_USABLE_PAGE || id > MAX_PAGE_ID {
            return Err(DbError::corrupt(format!("page id {} out of range", id)));
        }
        Ok(())
    }

    pub fn read_page(&self, id: PageId, buf: &mut [u8]) -> DbResult {
        self.check_page_id(id)?;
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.read_at(id * self.page_size as u64, buf)?;
        if let Some(crypto) = &self.crypto {
            crypto.decrypt(id, buf);
        }
        Ok(())
    }

    pub fn write_page(&self, id: PageId, buf: &[u8]) -> DbResult {
        self.check_page_id(id)?;
        debug_assert_eq!(buf.len(), self.page_size);
        if self.read_only {
            return Err(DbError::Unmodifiable);
        }
        if let Some(crypto) = &self.crypto {
            let mut tmp = buf.to_vec();
            crypto.encrypt(id, &mut tmp);
            self.file.write_at(id * self.page_size as u64, &tmp)
        } else {
            self.file.write_at(id * self.page_size as u64, buf)
        }
    }

    /// Extend the file by one page and return its id. The page contents are
    /// whatever the filesystem provides until first written.
    pub fn extend(&self) -> Result<PageId, DbError> {
        if self.read_only {
            return Err(DbError::Unmodifiable);
        }
        let id = self.page_count.fetch_add(1, Ordering::SeqCst);
        if id > MAX_PAGE_ID {
            self.page_count.fetch_sub(1, Ordering::SeqCst);
            return Err(DbError::LargeValue { len: id });
        }
        Ok(id)
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Durably commit: callers must already have written every dirty page.
    /// The new header lands in the inactive slot, is synced, and only then
    /// becomes the active one. A crash anywhere in between leaves the
    /// previous header intact.
    pub fn commit(&self, extra: CommitExtra) -> DbResult {
        if self.read_only {
            return Err(DbError::Unmodifiable);
        }
        // Data pages first; the header must never point at unwritten pages.
        self.file.sync_all()?;

        let mut state = self.state.lock().unwrap();
        let new_state = HeaderState {
            commit_counter: state.commit_counter + 1,
            active_slot: 1 - state.active_slot,
            extra,
        };
        let header = self.encode_header(&new_state, true);
        let offset = new_state.active_slot as u64 * self.page_size as u64;
        self.file.write_at(offset, &header)?;
        self.file.sync_all()?;
        *state = new_state;
        debug!(
            "commit #{} in slot {}, extra {:?}",
            state.commit_counter, state.active_slot, state.extra
        );
        Ok(())
    }

    pub fn read_commit_extra(&self) -> CommitExtra {
        self.state.lock().unwrap().extra
    }

    pub fn shared_commit_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_lock.read().unwrap()
    }

    pub fn exclusive_commit_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_lock.write().unwrap()
    }

    pub fn try_exclusive_commit_lock(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.commit_lock.try_write().ok()
    }

    pub fn sync(&self) -> DbResult {
        self.file.sync_all()
    }
}

pub fn lock_file_path(base: &Path) -> PathBuf {
    with_extension_suffix(base, "lock")
}

pub fn info_file_path(base: &Path) -> PathBuf {
    with_extension_suffix(base, "info")
}

pub fn redo_file_path(base: &Path, log_id: u64) -> PathBuf {
    with_extension_suffix(base, &format!("redo.{}", log_id))
}

fn with_extension_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn options(dir: &tempfile::TempDir) -> Options {
        Options::new(dir.path().join("store-test"))
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(&dir);

        {
            let (store, created) = PageStore::open(&opts).unwrap();
            assert!(created);
            assert_eq!(store.read_commit_extra().root_page_id, 0);
        }

        let (store, created) = PageStore::open(&opts).unwrap();
        assert!(!created);
        assert_eq!(store.read_commit_extra().encoding_version, 1);
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(&dir);
        let (_store, _) = PageStore::open(&opts).unwrap();
        match PageStore::open(&opts) {
            Err(DbError::Config(_)) => {}
            other => panic!("expected a config error, got {:?}", other),
        }
    }

    #[test]
    fn test_page_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(&dir);
        let (store, _) = PageStore::open(&opts).unwrap();

        let id = store.extend().unwrap();
        let page = vec![0xabu8; store.page_size()];
        store.write_page(id, &page).unwrap();

        let mut back = vec![0u8; store.page_size()];
        store.read_page(id, &mut back).unwrap();
        assert_eq!(page, back);
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(&dir);

        {
            let (store, _) = PageStore::open(&opts).unwrap();
            let extra = CommitExtra {
                encoding_version: 1,
                root_page_id: 42,
                master_undo_page_id: 0,
                transaction_id: 7,
                redo_position: 1234,
                redo_txn_id: 7,
            };
            store.commit(extra).unwrap();
            // A second commit lands in the other slot.
            let extra2 = CommitExtra {
                root_page_id: 43,
                ..extra
            };
            store.commit(extra2).unwrap();
        }

        let (store, _) = PageStore::open(&opts).unwrap();
        let extra = store.read_commit_extra();
        assert_eq!(extra.root_page_id, 43);
        assert_eq!(extra.redo_position, 1234);
    }

    #[test]
    fn test_header_corruption_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(&dir);

        {
            let (store, _) = PageStore::open(&opts).unwrap();
            store
                .commit(CommitExtra {
                    encoding_version: 1,
                    root_page_id: 9,
                    ..CommitExtra::default()
                })
                .unwrap();
        }

        // Flip a byte in the newest header (slot 1) and make sure the store
        // falls back to the older one.
        {
            let file = DbFile::open(&opts.base_file_path, false, false).unwrap();
            let mut buf = vec![0u8; 1];
            file.read_at(opts.page_size as u64 + 30, &mut buf).unwrap();
            buf[0] ^= 0xff;
            file.write_at(opts.page_size as u64 + 30, &buf).unwrap();
        }

        let (store, _) = PageStore::open(&opts).unwrap();
        assert_eq!(store.read_commit_extra().root_page_id, 0);
    }
}
