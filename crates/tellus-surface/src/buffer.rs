//! The tile buffer: descriptor pool, bounded load-request queue, and the
//! background tile loader thread.
//!
//! One mutex guards both the pool and the queue. The render thread holds it
//! for the whole per-frame traversal; the loader takes it only to copy out
//! the head request and again to publish finished textures. That second
//! critical section is the publication barrier: a traversal observes a tile
//! either fully unloaded (`FLAG_UNLOADED` set, unresolved index) or fully
//! loaded, never in between.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tellus_config::SurfaceConfig;
use tellus_device::{Device, TextureHandle};

use crate::dds;
use crate::tile::{
    FLAG_LIGHTS, FLAG_OLD_INDEX, FLAG_OPAQUE, FLAG_SPECULAR, FLAG_UNLOADED, TexRef,
    TileDescriptor, TileId,
};

/// Fixed record size of old-style tile archives: a 256x256 DXT1 surface
/// plus its DDS header. Old-style catalogue indices are multiplied by this
/// to obtain byte offsets.
pub const TILESIZE: u64 = 32896;

/// Pool growth step.
const POOL_GROW: usize = 16;

#[derive(Clone, Debug)]
struct QueueEntry {
    planet: String,
    tile: TileId,
}

/// The descriptor pool and load-request queue. Lives behind the queue mutex
/// owned by [`TileBuffer`].
pub struct TileStore {
    device: Arc<dyn Device>,
    slots: Vec<Option<TileDescriptor>>,
    used: usize,
    /// Rotating scan hint: index of the most recently filled slot.
    last: usize,
    queue: Vec<Option<QueueEntry>>,
    nqueue: usize,
    queue_in: usize,
    queue_out: usize,
}

impl TileStore {
    fn new(device: Arc<dyn Device>, queue_size: usize) -> Self {
        Self {
            device,
            slots: Vec::new(),
            used: 0,
            last: 0,
            queue: vec![None; queue_size.max(1)],
            nqueue: 0,
            queue_in: 0,
            queue_out: 0,
        }
    }

    /// Allocate a zeroed descriptor and return its slot id.
    ///
    /// Amortised O(1): a rotating hint finds the next free slot, and the
    /// pool grows by a fixed step when full. Growth cannot fail short of
    /// OOM, which aborts.
    pub fn add_tile(&mut self) -> TileId {
        if self.used == self.slots.len() {
            self.last = self.slots.len();
            self.slots.extend(std::iter::repeat_with(|| None).take(POOL_GROW));
        } else {
            let n = self.slots.len();
            for i in 0..n {
                let j = (i + self.last) % n;
                if self.slots[j].is_none() {
                    self.last = j;
                    break;
                }
            }
        }
        self.slots[self.last] = Some(TileDescriptor::default());
        self.used += 1;
        TileId(self.last as u32)
    }

    /// Borrow a descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the id refers to a freed slot.
    pub fn get(&self, id: TileId) -> &TileDescriptor {
        self.slots[id.index()].as_ref().expect("stale tile id")
    }

    /// Mutably borrow a descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the id refers to a freed slot.
    pub fn get_mut(&mut self, id: TileId) -> &mut TileDescriptor {
        self.slots[id.index()].as_mut().expect("stale tile id")
    }

    /// Number of live descriptors.
    pub fn used(&self) -> usize {
        self.used
    }

    fn try_get(&self, id: TileId) -> Option<&TileDescriptor> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Recursively delete a subtree.
    ///
    /// Returns `true` if the whole subtree was freed. A node whose `tex` is
    /// anything but `TexRef::None` refuses deletion (a loaded texture must
    /// not be dropped mid-use, and a catalogued index cannot be
    /// re-materialised once lost); refusal propagates upward.
    pub fn delete_tile(&mut self, id: TileId) -> bool {
        let subtiles = self.get(id).subtile;
        let mut deletable = true;
        for (i, sub) in subtiles.iter().enumerate() {
            if let Some(sub) = *sub {
                if self.delete_tile(sub) {
                    self.get_mut(id).subtile[i] = None;
                } else {
                    deletable = false;
                }
            }
        }
        if !deletable || self.get(id).tex != TexRef::None {
            return false;
        }
        if let TexRef::Loaded(mask) = self.get(id).ltex {
            self.device.release_texture(mask);
        }
        self.slots[id.index()] = None;
        self.used -= 1;
        true
    }

    /// Delete the children of a tile, clearing the links of those that
    /// could be freed.
    pub fn delete_subtiles(&mut self, id: TileId) {
        let subtiles = self.get(id).subtile;
        for (i, sub) in subtiles.iter().enumerate() {
            if let Some(sub) = *sub
                && self.delete_tile(sub)
            {
                self.get_mut(id).subtile[i] = None;
            }
        }
    }

    /// Unconditionally free a subtree, releasing any loaded textures.
    /// Used at planet teardown.
    pub fn free_subtree(&mut self, id: TileId) {
        let descriptor = self.get(id).clone();
        for sub in descriptor.subtile.into_iter().flatten() {
            self.free_subtree(sub);
        }
        if let TexRef::Loaded(tex) = descriptor.tex {
            self.device.release_texture(tex);
        }
        if let TexRef::Loaded(mask) = descriptor.ltex {
            self.device.release_texture(mask);
        }
        self.slots[id.index()] = None;
        self.used -= 1;
    }

    /// Queue an asynchronous texture load for a tile.
    ///
    /// Returns `false` without queuing when the queue is full or the tile
    /// is already queued; the traversal simply re-requests next frame.
    pub fn load_tile_async(&mut self, planet: &str, tile: TileId) -> bool {
        if self.nqueue == self.queue.len() {
            return false;
        }
        for i in 0..self.nqueue {
            let j = (i + self.queue_out) % self.queue.len();
            if let Some(entry) = &self.queue[j]
                && entry.tile == tile
            {
                return false;
            }
        }
        self.queue[self.queue_in] = Some(QueueEntry {
            planet: planet.to_owned(),
            tile,
        });
        self.nqueue += 1;
        self.queue_in = (self.queue_in + 1) % self.queue.len();
        true
    }

    /// Number of queued load requests.
    pub fn queue_len(&self) -> usize {
        self.nqueue
    }

    /// Copy of the head request, if any.
    fn front(&self) -> Option<(String, TileId)> {
        if self.nqueue == 0 {
            return None;
        }
        self.queue[self.queue_out]
            .as_ref()
            .map(|entry| (entry.planet.clone(), entry.tile))
    }

    /// Publish the textures of the head request and advance the queue.
    ///
    /// The descriptor may have been freed while its textures were on disk;
    /// in that case the textures are released instead of published.
    fn publish(&mut self, tile: TileId, tex: Option<TextureHandle>, ltex: Option<TextureHandle>) {
        let live = self
            .slots
            .get(tile.index())
            .is_some_and(|slot| slot.as_ref().is_some_and(|d| d.flag & FLAG_UNLOADED != 0));
        if live {
            let descriptor = self.slots[tile.index()].as_mut().unwrap();
            descriptor.tex = tex.map_or(TexRef::None, TexRef::Loaded);
            descriptor.ltex = ltex.map_or(TexRef::None, TexRef::Loaded);
            descriptor.flag &= !(FLAG_UNLOADED | FLAG_OLD_INDEX);
        } else {
            if let Some(handle) = tex {
                self.device.release_texture(handle);
            }
            if let Some(handle) = ltex {
                self.device.release_texture(handle);
            }
        }
        self.queue[self.queue_out] = None;
        self.nqueue -= 1;
        self.queue_out = (self.queue_out + 1) % self.queue.len();
    }

    fn release_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(descriptor) = slot.take() {
                if descriptor.flag & FLAG_UNLOADED == 0 {
                    if let TexRef::Loaded(tex) = descriptor.tex {
                        self.device.release_texture(tex);
                    }
                    if let TexRef::Loaded(mask) = descriptor.ltex {
                        self.device.release_texture(mask);
                    }
                }
                self.used -= 1;
            }
        }
    }
}

/// Owns the store mutex and the loader thread.
pub struct TileBuffer {
    state: Arc<Mutex<TileStore>>,
    run: Arc<AtomicBool>,
    hold: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TileBuffer {
    /// Create the buffer and spawn the loader thread.
    pub fn new(
        device: Arc<dyn Device>,
        texture_root: PathBuf,
        config: &SurfaceConfig,
        queue_size: usize,
    ) -> Self {
        let state = Arc::new(Mutex::new(TileStore::new(device.clone(), queue_size)));
        let run = Arc::new(AtomicBool::new(true));
        let hold = Arc::new(AtomicBool::new(false));

        let frequency = config.planet_load_frequency.max(1);
        let ctx = LoaderContext {
            state: Arc::clone(&state),
            device,
            texture_root,
            managed: config.managed_tiles,
            run: Arc::clone(&run),
            hold: Arc::clone(&hold),
            idle: Duration::from_millis((1000 / frequency).max(1) as u64),
        };
        let worker = std::thread::Builder::new()
            .name("tile-loader".into())
            .spawn(move || loader_main(ctx))
            .expect("failed to spawn tile loader thread");

        Self {
            state,
            run,
            hold,
            worker: Some(worker),
        }
    }

    /// Take the queue mutex. The traversal holds this guard for the whole
    /// frame.
    pub fn lock(&self) -> MutexGuard<'_, TileStore> {
        self.state.lock().unwrap()
    }

    /// Pause or resume the loader without dropping queued requests (used
    /// across device-loss windows).
    pub fn hold_loader(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }

    /// Number of load requests currently queued.
    pub fn pending(&self) -> usize {
        self.lock().queue_len()
    }
}

impl Drop for TileBuffer {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let mut store = self.state.lock().unwrap();
        let live = store.used();
        if live > 0 {
            tracing::debug!("releasing {live} tile descriptors at shutdown");
        }
        store.release_all();
    }
}

struct LoaderContext {
    state: Arc<Mutex<TileStore>>,
    device: Arc<dyn Device>,
    texture_root: PathBuf,
    managed: bool,
    run: Arc<AtomicBool>,
    hold: Arc<AtomicBool>,
    idle: Duration,
}

/// Archive byte offset of a catalogued texture index.
fn tile_offset(flag: u8, index: u32) -> u64 {
    if flag & FLAG_OLD_INDEX != 0 {
        index as u64 * TILESIZE
    } else {
        index as u64
    }
}

fn archive_path(root: &Path, planet: &str, mask: bool) -> PathBuf {
    let suffix = if mask { "_tile_lmask.tex" } else { "_tile.tex" };
    root.join("Textures2").join(format!("{planet}{suffix}"))
}

fn loader_main(ctx: LoaderContext) {
    loop {
        std::thread::sleep(ctx.idle);
        if !ctx.run.load(Ordering::Acquire) {
            return;
        }
        if ctx.hold.load(Ordering::Acquire) {
            continue;
        }

        // copy the head request and the fields the load needs; the tile may
        // have been deleted while queued, in which case publishing below
        // simply advances the queue
        let request = {
            let store = ctx.state.lock().unwrap();
            store.front().map(|(planet, tile)| match store.try_get(tile) {
                Some(descriptor) => {
                    (planet, tile, descriptor.flag, descriptor.tex, descriptor.ltex)
                }
                None => (planet, tile, 0, TexRef::None, TexRef::None),
            })
        };
        let Some((planet, tile, flag, tex_ref, ltex_ref)) = request else {
            continue;
        };

        // file I/O happens outside the mutex
        let tex = if let TexRef::Unresolved(index) = tex_ref {
            let path = archive_path(&ctx.texture_root, &planet, false);
            match dds::read_surface(
                ctx.device.as_ref(),
                &path,
                tile_offset(flag, index),
                ctx.managed,
            ) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::error!(
                        "failed to load surface tile {index} from {}: {err}",
                        path.display()
                    );
                    None
                }
            }
        } else {
            None
        };

        let wants_mask = (flag & (FLAG_OPAQUE | FLAG_SPECULAR)) == (FLAG_OPAQUE | FLAG_SPECULAR)
            || flag & FLAG_LIGHTS != 0;
        let ltex = match (wants_mask, ltex_ref) {
            (true, TexRef::Unresolved(index)) => {
                let path = archive_path(&ctx.texture_root, &planet, true);
                match dds::read_surface(
                    ctx.device.as_ref(),
                    &path,
                    tile_offset(flag, index),
                    ctx.managed,
                ) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        tracing::debug!(
                            "failed to load tile mask {index} from {}: {err}",
                            path.display()
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        ctx.state.lock().unwrap().publish(tile, tex, ltex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::NOTILE;
    use std::time::Instant;
    use tellus_device::HeadlessDevice;

    fn test_store(queue_size: usize) -> TileStore {
        TileStore::new(Arc::new(HeadlessDevice::new()), queue_size)
    }

    #[test]
    fn test_pool_grows_in_fixed_steps() {
        let mut store = test_store(16);
        for _ in 0..POOL_GROW {
            store.add_tile();
        }
        assert_eq!(store.slots.len(), POOL_GROW);

        store.add_tile();
        assert_eq!(store.slots.len(), 2 * POOL_GROW);
        assert_eq!(store.used(), POOL_GROW + 1);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut store = test_store(16);
        let ids: Vec<TileId> = (0..4).map(|_| store.add_tile()).collect();
        assert!(store.delete_tile(ids[1]));
        assert_eq!(store.used(), 3);

        let replacement = store.add_tile();
        assert_eq!(replacement, ids[1]);
        assert_eq!(store.slots.len(), POOL_GROW);
    }

    #[test]
    fn test_delete_refuses_while_subtree_holds_texture() {
        let device = Arc::new(HeadlessDevice::new());
        let mut store = TileStore::new(device, 16);

        let root = store.add_tile();
        let child = store.add_tile();
        let grandchild = store.add_tile();
        store.get_mut(root).subtile[0] = Some(child);
        store.get_mut(child).subtile[2] = Some(grandchild);
        store.get_mut(grandchild).tex = TexRef::Loaded(TextureHandle(99));

        // a loaded texture deep in the subtree blocks the whole delete
        assert!(!store.delete_tile(root));
        assert_eq!(store.used(), 3);

        store.get_mut(grandchild).tex = TexRef::None;
        assert!(store.delete_tile(root));
        assert_eq!(store.used(), 0);
    }

    #[test]
    fn test_delete_refuses_on_unresolved_catalogue_index() {
        let mut store = test_store(16);
        let tile = store.add_tile();
        store.get_mut(tile).tex = TexRef::Unresolved(7);
        assert!(!store.delete_tile(tile));
    }

    #[test]
    fn test_delete_subtiles_keeps_loaded_children() {
        let mut store = test_store(16);
        let root = store.add_tile();
        let free_child = store.add_tile();
        let loaded_child = store.add_tile();
        store.get_mut(root).subtile[0] = Some(free_child);
        store.get_mut(root).subtile[1] = Some(loaded_child);
        store.get_mut(loaded_child).tex = TexRef::Loaded(TextureHandle(1));

        store.delete_subtiles(root);
        assert_eq!(store.get(root).subtile[0], None);
        assert_eq!(store.get(root).subtile[1], Some(loaded_child));
    }

    #[test]
    fn test_queue_rejects_when_full_and_on_duplicates() {
        let mut store = test_store(10);
        let tiles: Vec<TileId> = (0..11).map(|_| store.add_tile()).collect();

        for tile in &tiles[..10] {
            assert!(store.load_tile_async("earth", *tile));
        }
        // 11th distinct request: queue full
        assert!(!store.load_tile_async("earth", tiles[10]));
        // duplicate of a queued request
        assert!(!store.load_tile_async("earth", tiles[3]));
        assert_eq!(store.queue_len(), 10);
    }

    #[test]
    fn test_queue_serves_requests_in_fifo_order() {
        let mut store = test_store(8);
        let a = store.add_tile();
        let b = store.add_tile();
        let c = store.add_tile();
        for tile in [a, b, c] {
            store.get_mut(tile).flag = FLAG_UNLOADED;
            assert!(store.load_tile_async("earth", tile));
        }

        for expected in [a, b, c] {
            let (_, head) = store.front().unwrap();
            assert_eq!(head, expected);
            store.publish(head, None, None);
        }
        assert_eq!(store.queue_len(), 0);
    }

    #[test]
    fn test_publish_clears_unloaded_and_old_index_flags() {
        let mut store = test_store(8);
        let tile = store.add_tile();
        store.get_mut(tile).flag = FLAG_UNLOADED | FLAG_OLD_INDEX | FLAG_SPECULAR | FLAG_OPAQUE;
        store.get_mut(tile).tex = TexRef::Unresolved(3);
        store.load_tile_async("earth", tile);

        store.publish(tile, Some(TextureHandle(5)), None);
        let descriptor = store.get(tile);
        assert_eq!(descriptor.flag, FLAG_SPECULAR | FLAG_OPAQUE);
        assert_eq!(descriptor.tex, TexRef::Loaded(TextureHandle(5)));
        assert_eq!(descriptor.ltex, TexRef::None);
    }

    #[test]
    fn test_publish_to_freed_slot_releases_textures() {
        let device = Arc::new(HeadlessDevice::new());
        let mut store = TileStore::new(Arc::clone(&device) as Arc<dyn Device>, 8);
        let tile = store.add_tile();
        store.get_mut(tile).flag = FLAG_UNLOADED;
        store.load_tile_async("earth", tile);
        assert!(store.delete_tile(tile));

        let orphan = device
            .create_texture(
                16,
                16,
                tellus_device::CompressedFormat::Dxt1,
                tellus_device::TexturePool::Managed,
            )
            .unwrap();
        assert_eq!(device.live_texture_count(), 1);
        store.publish(tile, Some(orphan), None);
        assert_eq!(device.live_texture_count(), 0);
        assert_eq!(store.queue_len(), 0);
    }

    #[test]
    fn test_old_index_offsets_scale_by_tilesize() {
        assert_eq!(tile_offset(FLAG_OLD_INDEX, 0), 0);
        assert_eq!(tile_offset(FLAG_OLD_INDEX, 3), 3 * TILESIZE);
        // new-style indices already are byte offsets
        assert_eq!(tile_offset(0, 98688), 98688);
    }

    #[test]
    fn test_loader_thread_services_queue() {
        let device = Arc::new(HeadlessDevice::new());
        let root = tempfile::tempdir().unwrap();
        let tile_dir = root.path().join("Textures2");
        std::fs::create_dir_all(&tile_dir).unwrap();

        // two 256x256 DXT1 tiles back to back: exactly TILESIZE bytes each
        let mut archive = Vec::new();
        archive.extend_from_slice(&crate::dds::test_dds_blob(256, 256, *b"DXT1"));
        archive.extend_from_slice(&crate::dds::test_dds_blob(256, 256, *b"DXT1"));
        std::fs::write(tile_dir.join("earth_tile.tex"), archive).unwrap();

        let config = SurfaceConfig {
            planet_load_frequency: 100,
            ..SurfaceConfig::default()
        };
        let buffer = TileBuffer::new(
            Arc::clone(&device) as Arc<dyn Device>,
            root.path().to_path_buf(),
            &config,
            8,
        );

        let (first, second) = {
            let mut store = buffer.lock();
            let first = store.add_tile();
            let second = store.add_tile();
            for (tile, index) in [(first, 0u32), (second, 1u32)] {
                let descriptor = store.get_mut(tile);
                descriptor.flag = FLAG_UNLOADED | FLAG_OLD_INDEX | FLAG_OPAQUE;
                descriptor.tex = TexRef::Unresolved(index);
                assert!(store.load_tile_async("earth", tile));
            }
            (first, second)
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            {
                let store = buffer.lock();
                let done = [first, second]
                    .iter()
                    .all(|&t| store.get(t).flag & FLAG_UNLOADED == 0);
                if done {
                    assert!(matches!(store.get(first).tex, TexRef::Loaded(_)));
                    assert!(matches!(store.get(second).tex, TexRef::Loaded(_)));
                    assert_eq!(store.queue_len(), 0);
                    break;
                }
            }
            assert!(Instant::now() < deadline, "loader did not drain the queue");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_loader_publishes_failure_as_missing_texture() {
        // no archive on disk: the descriptor must end up loaded-with-no-texture
        let device = Arc::new(HeadlessDevice::new());
        let root = tempfile::tempdir().unwrap();
        let config = SurfaceConfig {
            planet_load_frequency: 100,
            ..SurfaceConfig::default()
        };
        let buffer = TileBuffer::new(
            Arc::clone(&device) as Arc<dyn Device>,
            root.path().to_path_buf(),
            &config,
            8,
        );

        let tile = {
            let mut store = buffer.lock();
            let tile = store.add_tile();
            store.get_mut(tile).flag = FLAG_UNLOADED | FLAG_OLD_INDEX;
            store.get_mut(tile).tex = TexRef::from_index(0);
            assert!(store.load_tile_async("mars", tile));
            tile
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            {
                let store = buffer.lock();
                if store.get(tile).flag & FLAG_UNLOADED == 0 {
                    assert_eq!(store.get(tile).tex, TexRef::None);
                    break;
                }
            }
            assert!(Instant::now() < deadline, "loader never published");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(device.live_texture_count(), 0);
    }

    #[test]
    fn test_notile_index_skips_archive_read() {
        assert_eq!(TexRef::from_index(NOTILE), TexRef::None);
    }

    #[test]
    fn test_full_queue_drains_with_one_publication_each() {
        let device = Arc::new(HeadlessDevice::new());
        let root = tempfile::tempdir().unwrap();
        let config = SurfaceConfig {
            planet_load_frequency: 100,
            ..SurfaceConfig::default()
        };
        let buffer = TileBuffer::new(
            Arc::clone(&device) as Arc<dyn Device>,
            root.path().to_path_buf(),
            &config,
            10,
        );

        let tiles: Vec<TileId> = {
            let mut store = buffer.lock();
            let tiles: Vec<TileId> = (0..11u32)
                .map(|i| {
                    let tile = store.add_tile();
                    store.get_mut(tile).flag = FLAG_UNLOADED | FLAG_OLD_INDEX;
                    store.get_mut(tile).tex = TexRef::Unresolved(i);
                    tile
                })
                .collect();
            for tile in &tiles[..10] {
                assert!(store.load_tile_async("pluto", *tile));
            }
            assert!(!store.load_tile_async("pluto", tiles[10]));
            assert!(!store.load_tile_async("pluto", tiles[0]));
            assert_eq!(store.queue_len(), 10);
            tiles
        };

        // the archive is absent, so each request publishes tex = None
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            {
                let store = buffer.lock();
                if store.queue_len() == 0 {
                    for tile in &tiles[..10] {
                        assert_eq!(store.get(*tile).flag & FLAG_UNLOADED, 0);
                        assert_eq!(store.get(*tile).tex, TexRef::None);
                    }
                    // the rejected request was never serviced
                    assert_ne!(store.get(tiles[10]).flag & FLAG_UNLOADED, 0);
                    break;
                }
            }
            assert!(Instant::now() < deadline, "queue never drained");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
