//! # Write Cache / File Manager
//!
//! Maps logical file names to numeric file ids and owns the backing files.
//! Every durable component addresses its storage as `(file_id, page_index)`;
//! this module is the only place that touches the filesystem for data pages.
//!
//! ## Responsibilities
//!
//! - Name registry: `book_file_id` reserves an id before the creation is
//!   logged, `add_file` materializes the file under that id, `open_file`
//!   attaches an existing file.
//! - Page IO: `read_page` / `write_page` against a fixed [`PAGE_SIZE`] grid,
//!   `extend` grows a file by exactly one page.
//! - Lifecycle: `truncate_file`, `delete_file`, fsync via `flush`.
//!
//! File ids are stable: the name-to-id map is persisted to `tessera.files`
//! on every change (write-then-rename), so WAL records keep addressing the
//! right files across restarts even after a checkpoint has truncated the
//! file-created records out of the log. Ids are never recycled, and
//! `add_file` keeps the allocator above every id it has seen.
//!
//! ## Thread Safety
//!
//! The registry is behind a `parking_lot::RwLock`; each file handle carries
//! its own mutex so concurrent IO to different files does not serialize. Page
//! counts are atomics updated under the file mutex.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::PAGE_SIZE;

struct FileState {
    name: String,
    file: Mutex<File>,
    pages: AtomicU32,
}

impl FileState {
    fn pages(&self) -> u32 {
        self.pages.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, u32>,
    files: HashMap<u32, Arc<FileState>>,
    booked: HashMap<u32, String>,
}

/// Name of the persisted id map inside the engine directory.
pub const FILE_MAP_NAME: &str = "tessera.files";

pub struct WriteCache {
    dir: PathBuf,
    registry: RwLock<Registry>,
    next_file_id: AtomicU32,
}

impl WriteCache {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create engine directory {:?}", dir))?;

        let cache = Self {
            dir,
            registry: RwLock::new(Registry::default()),
            next_file_id: AtomicU32::new(1),
        };
        cache.load_map()?;
        Ok(cache)
    }

    /// Re-attaches every file recorded in the persisted id map. Entries
    /// whose backing file vanished are dropped.
    fn load_map(&self) -> Result<()> {
        let map_path = self.dir.join(FILE_MAP_NAME);
        if !map_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&map_path)
            .wrap_err_with(|| format!("failed to read file map at {:?}", map_path))?;

        let mut registry = self.registry.write();
        for line in content.lines() {
            let (id_part, name) = match line.split_once('\t') {
                Some(parts) => parts,
                None => continue,
            };
            let file_id: u32 = id_part
                .parse()
                .map_err(|e| eyre::eyre!("corrupt file map entry '{}': {}", line, e))?;

            let path = self.path_for(name);
            if !path.exists() {
                continue;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to open file at {:?}", path))?;
            let len = file.metadata().wrap_err("failed to stat file")?.len();
            ensure!(
                len % PAGE_SIZE as u64 == 0,
                "file '{}' length {} is not page aligned",
                name,
                len
            );

            registry.by_name.insert(name.to_string(), file_id);
            registry.files.insert(
                file_id,
                Arc::new(FileState {
                    name: name.to_string(),
                    file: Mutex::new(file),
                    pages: AtomicU32::new((len / PAGE_SIZE as u64) as u32),
                }),
            );
            self.bump_next_id(file_id);
        }
        Ok(())
    }

    /// Persists the id map with a write-then-rename so a crash never leaves
    /// a half-written map.
    fn persist_map(&self, registry: &Registry) -> Result<()> {
        let mut content = String::new();
        for state in registry.files.values() {
            let file_id = registry.by_name[&state.name];
            content.push_str(&format!("{}\t{}\n", file_id, state.name));
        }

        let tmp_path = self.dir.join(format!("{}.tmp", FILE_MAP_NAME));
        std::fs::write(&tmp_path, content).wrap_err("failed to write file map")?;
        let file = File::open(&tmp_path).wrap_err("failed to reopen file map")?;
        file.sync_all().wrap_err("failed to sync file map")?;
        std::fs::rename(&tmp_path, self.dir.join(FILE_MAP_NAME))
            .wrap_err("failed to publish file map")?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn bump_next_id(&self, seen: u32) {
        let mut current = self.next_file_id.load(Ordering::Relaxed);
        while current <= seen {
            match self.next_file_id.compare_exchange(
                current,
                seen + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserves a file id for `name` without touching the filesystem. The
    /// caller logs the creation and then calls [`Self::add_file`].
    pub fn book_file_id(&self, name: &str) -> Result<u32> {
        let mut registry = self.registry.write();
        ensure!(
            !registry.by_name.contains_key(name),
            "file '{}' already exists",
            name
        );

        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        registry.booked.insert(file_id, name.to_string());
        Ok(file_id)
    }

    /// Creates the backing file for a previously booked (or replayed) id.
    pub fn add_file(&self, name: &str, file_id: u32) -> Result<()> {
        self.bump_next_id(file_id);

        let mut registry = self.registry.write();
        registry.booked.remove(&file_id);
        ensure!(
            !registry.by_name.contains_key(name),
            "file '{}' already exists",
            name
        );
        ensure!(
            !registry.files.contains_key(&file_id),
            "file id {} already in use",
            file_id
        );

        let path = self.path_for(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create file at {:?}", path))?;

        debug!(name, file_id, "created data file");

        registry.by_name.insert(name.to_string(), file_id);
        registry.files.insert(
            file_id,
            Arc::new(FileState {
                name: name.to_string(),
                file: Mutex::new(file),
                pages: AtomicU32::new(0),
            }),
        );
        self.persist_map(&registry)?;
        Ok(())
    }

    /// Attaches an existing file under a specific id. Used by WAL recovery
    /// to replay file-created records against files that already exist.
    pub fn open_file_with_id(&self, name: &str, file_id: u32) -> Result<()> {
        self.bump_next_id(file_id);

        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open file at {:?}", path))?;

        let len = file
            .metadata()
            .wrap_err("failed to read file metadata")?
            .len();
        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "file '{}' length {} is not page aligned",
            name,
            len
        );

        let mut registry = self.registry.write();
        registry.booked.remove(&file_id);
        ensure!(
            !registry.by_name.contains_key(name) && !registry.files.contains_key(&file_id),
            "file '{}' (id {}) already registered",
            name,
            file_id
        );

        registry.by_name.insert(name.to_string(), file_id);
        registry.files.insert(
            file_id,
            Arc::new(FileState {
                name: name.to_string(),
                file: Mutex::new(file),
                pages: AtomicU32::new((len / PAGE_SIZE as u64) as u32),
            }),
        );
        self.persist_map(&registry)?;
        Ok(())
    }

    /// Attaches an existing file, assigning it a fresh id if it is not
    /// already registered.
    pub fn open_file(&self, name: &str) -> Result<u32> {
        {
            let registry = self.registry.read();
            if let Some(&file_id) = registry.by_name.get(name) {
                return Ok(file_id);
            }
        }

        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open file at {:?}", path))?;

        let len = file
            .metadata()
            .wrap_err("failed to read file metadata")?
            .len();
        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "file '{}' length {} is not page aligned",
            name,
            len
        );

        let mut registry = self.registry.write();
        if let Some(&file_id) = registry.by_name.get(name) {
            return Ok(file_id);
        }

        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        registry.by_name.insert(name.to_string(), file_id);
        registry.files.insert(
            file_id,
            Arc::new(FileState {
                name: name.to_string(),
                file: Mutex::new(file),
                pages: AtomicU32::new((len / PAGE_SIZE as u64) as u32),
            }),
        );
        self.persist_map(&registry)?;
        Ok(file_id)
    }

    pub fn exists(&self, name: &str) -> bool {
        if self.registry.read().by_name.contains_key(name) {
            return true;
        }
        self.path_for(name).exists()
    }

    pub fn file_name(&self, file_id: u32) -> Result<String> {
        let registry = self.registry.read();
        match registry.files.get(&file_id) {
            Some(state) => Ok(state.name.clone()),
            None => bail!("unknown file id {}", file_id),
        }
    }

    /// Number of pages currently in the file.
    pub fn filled_up_to(&self, file_id: u32) -> Result<u32> {
        Ok(self.state(file_id)?.pages())
    }

    fn state(&self, file_id: u32) -> Result<Arc<FileState>> {
        let registry = self.registry.read();
        match registry.files.get(&file_id) {
            Some(state) => Ok(Arc::clone(state)),
            None => bail!("unknown file id {}", file_id),
        }
    }

    pub fn read_page(&self, file_id: u32, page_index: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(buf.len() == PAGE_SIZE, "page buffer size mismatch");
        let state = self.state(file_id)?;
        ensure!(
            page_index < state.pages(),
            "page {} beyond end of file '{}' ({} pages)",
            page_index,
            state.name,
            state.pages()
        );

        let mut file = state.file.lock();
        file.seek(SeekFrom::Start(page_index as u64 * PAGE_SIZE as u64))
            .wrap_err("failed to seek for page read")?;
        file.read_exact(buf)
            .wrap_err_with(|| format!("failed to read page {} of '{}'", page_index, state.name))?;
        Ok(())
    }

    pub fn write_page(&self, file_id: u32, page_index: u32, buf: &[u8]) -> Result<()> {
        ensure!(buf.len() == PAGE_SIZE, "page buffer size mismatch");
        let state = self.state(file_id)?;
        ensure!(
            page_index < state.pages(),
            "page {} beyond end of file '{}' ({} pages)",
            page_index,
            state.name,
            state.pages()
        );

        let mut file = state.file.lock();
        file.seek(SeekFrom::Start(page_index as u64 * PAGE_SIZE as u64))
            .wrap_err("failed to seek for page write")?;
        file.write_all(buf)
            .wrap_err_with(|| format!("failed to write page {} of '{}'", page_index, state.name))?;
        Ok(())
    }

    /// Grows the file by one zeroed page, returning its index.
    pub fn extend(&self, file_id: u32) -> Result<u32> {
        let state = self.state(file_id)?;
        let file = state.file.lock();
        let new_index = state.pages();
        file.set_len((new_index as u64 + 1) * PAGE_SIZE as u64)
            .wrap_err_with(|| format!("failed to extend file '{}'", state.name))?;
        state.pages.store(new_index + 1, Ordering::Release);
        Ok(new_index)
    }

    pub fn truncate_file(&self, file_id: u32) -> Result<()> {
        let state = self.state(file_id)?;
        let file = state.file.lock();
        file.set_len(0)
            .wrap_err_with(|| format!("failed to truncate file '{}'", state.name))?;
        state.pages.store(0, Ordering::Release);
        Ok(())
    }

    pub fn delete_file(&self, file_id: u32) -> Result<()> {
        let mut registry = self.registry.write();
        let state = match registry.files.remove(&file_id) {
            Some(state) => state,
            None => bail!("unknown file id {}", file_id),
        };
        registry.by_name.remove(&state.name);
        self.persist_map(&registry)?;
        drop(registry);

        let path = self.path_for(&state.name);
        std::fs::remove_file(&path)
            .wrap_err_with(|| format!("failed to delete file at {:?}", path))?;
        debug!(name = %state.name, file_id, "deleted data file");
        Ok(())
    }

    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        let state = self.state(file_id)?;
        let file = state.file.lock();
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync file '{}'", state.name))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let states: Vec<Arc<FileState>> = {
            let registry = self.registry.read();
            registry.files.values().cloned().collect()
        };
        for state in states {
            let file = state.file.lock();
            file.sync_all()
                .wrap_err_with(|| format!("failed to sync file '{}'", state.name))?;
        }
        Ok(())
    }
}
