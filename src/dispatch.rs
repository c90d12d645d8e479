// Routes decoded device messages to their category handler. Settings register
// unseen devices, images are resolved to their owner, written under the
// owner's cache directory and recorded; video and audio are accepted and
// ignored for now.
use std::io::Write;
use std::path::{Path, PathBuf};

use duckdb::types::Value;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::db::DbHandle;
use crate::error::{GatewayError, Result};
use crate::frame::ImageFrame;
use crate::models::{Device, DeviceUserMapping, Entity, Image, User};
use crate::topics::{Category, DeviceData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    DeviceRegistered { id: i64 },
    /// Settings for a device that already exists. Nothing is written.
    DeviceKnown { id: i64 },
    ImageStored { id: i64, path: PathBuf },
    Ignored(Category),
}

/// Device fields a settings payload may carry.
#[derive(Debug, Default, Deserialize)]
struct SettingsPayload {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    firmware: Option<String>,
}

pub struct Dispatcher {
    db: DbHandle,
    cache_root: PathBuf,
}

impl Dispatcher {
    pub fn new(db: DbHandle, cache_root: impl Into<PathBuf>) -> Self {
        Dispatcher {
            db,
            cache_root: cache_root.into(),
        }
    }

    pub async fn dispatch(&self, data: DeviceData) -> Result<Dispatched> {
        match data {
            DeviceData::Settings { device_id, payload } => {
                self.process_settings(&device_id, &payload).await
            }
            DeviceData::Image { device_id, payload } => {
                self.process_image(&device_id, &payload).await
            }
            DeviceData::Video { .. } => Ok(Dispatched::Ignored(Category::Video)),
            DeviceData::Audio { .. } => Ok(Dispatched::Ignored(Category::Audio)),
        }
    }

    async fn process_settings(&self, serial: &str, payload: &[u8]) -> Result<Dispatched> {
        if let Some(existing) = self
            .db
            .load_by_field::<Device>(Value::Text(serial.to_string()))
            .await?
        {
            // Known devices are left untouched; updating stored settings from
            // a repeated message has not been specified yet.
            info!(device = ?existing, "retrieved settings for known device");
            return Ok(Dispatched::DeviceKnown { id: existing.id });
        }

        let mut device = Device {
            serial: serial.to_string(),
            active: true,
            ..Default::default()
        };
        match serde_json::from_slice::<SettingsPayload>(payload) {
            Ok(settings) => {
                device.model = settings.model.unwrap_or_default();
                device.firmware = settings.firmware.unwrap_or_default();
            }
            Err(e) => error!(serial, error = %e, "unable to decode device settings json; using defaults"),
        }

        let id = self.db.create(&mut device).await.map_err(|e| {
            error!(serial, error = %e, "failed to add device to database");
            GatewayError::PersistenceFailure(e)
        })?;
        info!(serial, id, "registered new device");
        Ok(Dispatched::DeviceRegistered { id })
    }

    /// device by serial -> mapping by device id -> user by id.
    async fn resolve_owner(&self, serial: &str) -> Result<(DeviceUserMapping, User)> {
        let device: Device = self
            .db
            .load_by_field(Value::Text(serial.to_string()))
            .await?
            .ok_or_else(|| GatewayError::not_found(Device::NAME, serial))?;
        debug!(device = ?device, "retrieved device");

        let mapping: DeviceUserMapping = self
            .db
            .load_by_field(Value::BigInt(device.id))
            .await?
            .ok_or_else(|| GatewayError::not_found(DeviceUserMapping::NAME, device.id))?;

        let user: User = self
            .db
            .load(mapping.user_id)
            .await?
            .ok_or_else(|| GatewayError::not_found(User::NAME, mapping.user_id))?;

        Ok((mapping, user))
    }

    async fn process_image(&self, serial: &str, payload: &[u8]) -> Result<Dispatched> {
        let (mapping, user) = self.resolve_owner(serial).await?;
        if !is_path_component(&user.user_name) {
            return Err(GatewayError::UnusableUserName {
                user_id: user.id,
                name: user.user_name,
            });
        }

        let frame = ImageFrame::decode(payload)?;
        // `target` did not exist before this call, so removing it on a later
        // failure only undoes this message.
        let target = store_frame(self.cache_root.join(&user.user_name), frame).await?;

        let mut image = Image {
            user_id: mapping.user_id,
            device_id: mapping.device_id,
            path: target.to_string_lossy().into_owned(),
            active: true,
            ..Default::default()
        };
        if let Err(e) = self.db.create(&mut image).await {
            discard(&target).await;
            return Err(GatewayError::PersistenceFailure(e));
        }

        info!(serial, id = image.id, path = %target.display(), "stored image");
        Ok(Dispatched::ImageStored {
            id: image.id,
            path: target,
        })
    }
}

fn is_path_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

async fn store_frame(dir: PathBuf, frame: ImageFrame) -> Result<PathBuf> {
    task::spawn_blocking(move || write_frame(&dir, &frame))
        .await
        .map_err(|e| std::io::Error::other(format!("image write task failed: {e}")))?
}

/// Write the frame body to an anonymous temp file in `dir`, check the byte
/// count on disk against the declared size and only then link it under the
/// frame's filename. An existing file is never replaced. On any error the
/// temp file is removed when it drops.
fn write_frame(dir: &Path, frame: &ImageFrame) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(&frame.filename);

    let mut partial = NamedTempFile::new_in(dir)?;
    partial.write_all(&frame.body)?;
    partial.flush()?;
    partial.as_file().sync_all()?;
    let written = partial.as_file().metadata()?.len();
    frame.verify_written(written)?;

    match partial.persist_noclobber(&target) {
        Ok(_) => Ok(target),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(GatewayError::ImageExists(target))
        }
        Err(e) => Err(e.error.into()),
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove image file");
        }
    }
}
