//! Per-image state shared by the pipeline

use crate::async_op::AsyncOpList;
use crate::engine::Executor;
use crate::striper::{ObjectNo, Striper};

use parking_lot::{Mutex, RwLock};
use rbdio_client::ObjectBackend;
use rbdio_common::{Error, ImageArea, ImageOptions, NOSNAP, Result, SnapId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapInfo {
    pub name: String,
    /// Image size when the snapshot was taken
    pub size: u64,
}

/// Image metadata guarded by the image lock
#[derive(Debug, Clone)]
pub struct ImageState {
    /// Size of the data area in bytes
    pub size: u64,
    /// Snapshot the image is pinned to, [`NOSNAP`] for the writable head
    pub snap_id: SnapId,
    pub read_only: bool,
    pub snaps: BTreeMap<SnapId, SnapInfo>,
    /// Size of the crypto header area preceding the data area
    pub crypto_header_size: u64,
}

impl ImageState {
    /// Size of an addressable area at the pinned snapshot
    pub fn area_size(&self, area: ImageArea) -> u64 {
        match area {
            ImageArea::CryptoHeader => self.crypto_header_size,
            ImageArea::Data => match self.snaps.get(&self.snap_id) {
                Some(snap) if self.snap_id != NOSNAP => snap.size,
                _ => self.size,
            },
        }
    }

    /// Raw image offset of an area's first byte
    pub fn area_base(&self, area: ImageArea) -> u64 {
        match area {
            ImageArea::CryptoHeader => 0,
            ImageArea::Data => self.crypto_header_size,
        }
    }

    /// Check if writes must be rejected
    pub fn is_write_protected(&self) -> bool {
        self.read_only || self.snap_id != NOSNAP
    }
}

/// Header change published by another client, applied on next refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderUpdate {
    Resize(u64),
    SetReadOnly(bool),
    SnapCreate { snap_id: SnapId, name: String },
    SnapRemove(SnapId),
}

/// Open image
///
/// Holds the object layout, the metadata lock, the active-operation list and
/// the collaborators every stage needs.
pub struct ImageCtx {
    pub id: String,
    pub name: String,
    pub striper: Striper,
    pub options: ImageOptions,
    pub image_lock: RwLock<ImageState>,
    /// Held for read while flush barriers complete
    pub owner_lock: RwLock<()>,
    pub async_ops: AsyncOpList,
    pub engine: Arc<dyn Executor>,
    pub backend: Arc<dyn ObjectBackend>,
    pending_updates: Mutex<Vec<HeaderUpdate>>,
}

impl ImageCtx {
    /// Open an image of `size` bytes
    pub fn new(
        name: impl Into<String>,
        size: u64,
        options: ImageOptions,
        engine: Arc<dyn Executor>,
        backend: Arc<dyn ObjectBackend>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_argument("image name must not be empty"));
        }

        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(12);
        info!(image = %name, id = %id, size, "Opening image");

        Ok(Arc::new(Self {
            id,
            name,
            striper: Striper::new(options.object_order),
            image_lock: RwLock::new(ImageState {
                size,
                snap_id: NOSNAP,
                read_only: options.read_only,
                snaps: BTreeMap::new(),
                crypto_header_size: 0,
            }),
            options,
            owner_lock: RwLock::new(()),
            async_ops: AsyncOpList::new(),
            engine,
            backend,
            pending_updates: Mutex::new(Vec::new()),
        }))
    }

    /// Current data area size
    pub fn size(&self) -> u64 {
        self.image_lock.read().area_size(ImageArea::Data)
    }

    pub fn snap_id(&self) -> SnapId {
        self.image_lock.read().snap_id
    }

    pub fn is_read_only(&self) -> bool {
        self.image_lock.read().read_only
    }

    /// Backend object name for an object number
    pub fn object_name(&self, object_no: ObjectNo) -> String {
        format!("rbd_data.{}.{:016x}", self.id, object_no)
    }

    /// Reserve a crypto header area in front of the data area
    pub fn set_crypto_header_size(&self, size: u64) {
        self.image_lock.write().crypto_header_size = size;
    }

    /// Pin the image to a snapshot, or back to the head with [`NOSNAP`]
    pub fn snap_set(&self, snap_id: SnapId) -> Result<()> {
        let mut state = self.image_lock.write();
        if snap_id != NOSNAP && !state.snaps.contains_key(&snap_id) {
            return Err(Error::NotFound(format!("snapshot {snap_id}")));
        }
        state.snap_id = snap_id;
        debug!(image = %self.name, snap_id, "Set snapshot");
        Ok(())
    }

    /// Publish a header change; in-flight routing picks it up on refresh
    pub fn notify_header_update(&self, update: HeaderUpdate) {
        debug!(image = %self.name, ?update, "Header update pending");
        self.pending_updates.lock().push(update);
    }

    /// Check if a header update awaits refresh
    pub fn refresh_required(&self) -> bool {
        !self.pending_updates.lock().is_empty()
    }

    /// Apply every pending header update under the image lock
    pub fn refresh(&self) -> usize {
        let updates = std::mem::take(&mut *self.pending_updates.lock());
        if updates.is_empty() {
            return 0;
        }

        let mut state = self.image_lock.write();
        for update in &updates {
            match update {
                HeaderUpdate::Resize(size) => state.size = *size,
                HeaderUpdate::SetReadOnly(read_only) => state.read_only = *read_only,
                HeaderUpdate::SnapCreate { snap_id, name } => {
                    let info = SnapInfo {
                        name: name.clone(),
                        size: state.size,
                    };
                    state.snaps.insert(*snap_id, info);
                }
                HeaderUpdate::SnapRemove(snap_id) => {
                    state.snaps.remove(snap_id);
                    if state.snap_id == *snap_id {
                        state.snap_id = NOSNAP;
                    }
                }
            }
        }
        info!(image = %self.name, updates = updates.len(), size = state.size, "Refreshed image");
        updates.len()
    }
}
