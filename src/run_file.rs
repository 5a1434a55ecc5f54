//! Persisted run file.
//!
//! A shot is described by a hierarchical document holding one group per
//! device under `devices/<device_name>`:
//!
//! - `EXPOSURES`: table of exposure rows `[name, frametype, t, trigger_duration, action]`
//!   (at least 5 fields, field 4 is the action reference or an absent marker)
//! - `device_properties`: `camera_attributes`, `stop_acquisition_timeout` (s),
//!   `exception_on_failed_shot`, `saved_attribute_visibility_level`
//!
//! Acquired images are written back under `images/<device_name>`, grouped by
//! exposure name and frame type.
//!
//! Two backends are provided: JSON (always available) and HDF5 (behind the
//! `storage_hdf5` feature). [`open`] picks one from the file extension.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::attributes::{AttributeSet, VisibilityLevel};
use crate::error::{AppResult, CameraError};
use crate::sdk::Image;

/// Minimum number of fields in an exposure row.
pub const EXPOSURE_FIELDS: usize = 5;

const ACTION_FIELD: usize = 4;

/// One row of the `EXPOSURES` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRecord {
    /// Exposure name, used as the image group name.
    pub name: String,
    /// Frame type within the exposure.
    pub frame_type: String,
    /// Trigger time within the shot, in seconds.
    pub t: f64,
    /// Trigger pulse length, in seconds.
    pub trigger_duration: f64,
    /// Action run on the frames of this exposure.
    pub action: Option<String>,
}

impl ExposureRecord {
    /// Exposure without an action.
    pub fn new(name: impl Into<String>, frame_type: impl Into<String>, t: f64) -> Self {
        Self {
            name: name.into(),
            frame_type: frame_type.into(),
            t,
            trigger_duration: 0.0,
            action: None,
        }
    }

    /// Attach an action to the exposure.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Parse a row. Numeric fields may be stored as numbers or strings.
    pub fn from_fields(fields: &[Value]) -> AppResult<Self> {
        if fields.len() < EXPOSURE_FIELDS {
            return Err(CameraError::RunFile(format!(
                "exposure row has {} field(s), expected at least {}",
                fields.len(),
                EXPOSURE_FIELDS
            )));
        }
        Ok(Self {
            name: field_str(&fields[0]),
            frame_type: field_str(&fields[1]),
            t: field_f64("t", &fields[2])?,
            trigger_duration: field_f64("trigger_duration", &fields[3])?,
            action: field_action(&fields[ACTION_FIELD]),
        })
    }

    /// Row as stored in the `EXPOSURES` table.
    pub fn to_fields(&self) -> Vec<Value> {
        vec![
            json!(self.name),
            json!(self.frame_type),
            json!(self.t),
            json!(self.trigger_duration),
            self.action.as_ref().map_or(Value::Null, |a| json!(a)),
        ]
    }
}

fn field_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn field_f64(field: &str, value: &Value) -> AppResult<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        CameraError::RunFile(format!("exposure field '{}' is not a number: {}", field, value))
    })
}

/// `null`, empty strings and `"None"` all mean "no action".
fn field_action(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() || s == "None" => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Exposure rows in file order. Row `i` describes image `i` of the shot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExposureTable {
    records: Vec<ExposureRecord>,
}

impl ExposureTable {
    /// Table of `records`.
    pub fn new(records: Vec<ExposureRecord>) -> Self {
        Self { records }
    }

    /// Parse rows of the `EXPOSURES` table.
    pub fn from_rows(rows: &[Vec<Value>]) -> AppResult<Self> {
        let records = rows
            .iter()
            .map(|row| ExposureRecord::from_fields(row))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { records })
    }

    /// Number of exposures.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The action column, one entry per image.
    pub fn actions(&self) -> Vec<Option<String>> {
        self.records.iter().map(|r| r.action.clone()).collect()
    }

    /// Rows in table order.
    pub fn iter(&self) -> impl Iterator<Item = &ExposureRecord> {
        self.records.iter()
    }

    /// Rows as a slice.
    pub fn records(&self) -> &[ExposureRecord] {
        &self.records
    }
}

/// Per-device settings stored alongside the exposure table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Attributes to program for the shot.
    #[serde(default)]
    pub camera_attributes: AttributeSet,
    /// Seconds to wait for the acquisition thread at the end of the shot
    #[serde(default)]
    pub stop_acquisition_timeout: Option<f64>,
    /// Report a failed shot as an error instead of saving it.
    #[serde(default = "default_exception_on_failed_shot")]
    pub exception_on_failed_shot: bool,
    /// Save the camera attributes with the images at this level.
    #[serde(default)]
    pub saved_attribute_visibility_level: Option<VisibilityLevel>,
}

fn default_exception_on_failed_shot() -> bool {
    true
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            camera_attributes: AttributeSet::new(),
            stop_acquisition_timeout: None,
            exception_on_failed_shot: true,
            saved_attribute_visibility_level: None,
        }
    }
}

impl DeviceProperties {
    /// Stop timeout from the file, or `default` when absent or invalid.
    pub fn stop_timeout(&self, default: Duration) -> Duration {
        self.stop_acquisition_timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(default)
    }
}

/// What a run file holds for one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceGroup {
    /// `None` when the device takes no images this shot.
    pub exposures: Option<ExposureTable>,
    /// Settings of the device for this shot.
    pub properties: DeviceProperties,
}

/// Images of one exposure name and frame type, in acquisition order.
#[derive(Debug, Clone)]
pub struct ImageGroup {
    /// Exposure name.
    pub name: String,
    /// Frame type.
    pub frame_type: String,
    /// Images in acquisition order.
    pub images: Vec<Image>,
}

/// Everything written back to the run file after a shot.
#[derive(Debug, Clone, Default)]
pub struct ShotImages {
    /// Image groups in first-seen order.
    pub groups: Vec<ImageGroup>,
    /// Camera attributes to store with the images.
    pub attributes: Option<AttributeSet>,
    /// Set when the shot failed and was saved anyway.
    pub failed_shot: bool,
}

impl ShotImages {
    /// Pair image `i` with exposure row `i` and group by (name, frame type).
    ///
    /// Images beyond the table (one-batch modes can return more frames than
    /// rows) are kept under `unassigned/frame`.
    pub fn from_exposures(exposures: &ExposureTable, images: Vec<Image>) -> Self {
        let mut shot = ShotImages::default();
        let total = images.len();
        for (index, image) in images.into_iter().enumerate() {
            let (name, frame_type) = match exposures.records().get(index) {
                Some(record) => (record.name.as_str(), record.frame_type.as_str()),
                None => ("unassigned", "frame"),
            };
            shot.push(name, frame_type, image);
        }
        if total > exposures.len() {
            warn!(
                "{} image(s) acquired for {} exposure(s); extra images saved as unassigned",
                total,
                exposures.len()
            );
        }
        shot
    }

    /// Append `image` to its (name, frame type) group.
    pub fn push(&mut self, name: &str, frame_type: &str, image: Image) {
        match self
            .groups
            .iter_mut()
            .find(|g| g.name == name && g.frame_type == frame_type)
        {
            Some(group) => group.images.push(image),
            None => self.groups.push(ImageGroup {
                name: name.to_string(),
                frame_type: frame_type.to_string(),
                images: vec![image],
            }),
        }
    }

    /// Total number of images.
    pub fn image_count(&self) -> usize {
        self.groups.iter().map(|g| g.images.len()).sum()
    }
}

/// Stack same-shaped images along a new leading axis.
pub fn stack_images(images: &[Image]) -> AppResult<ArrayD<u16>> {
    let views: Vec<_> = images.iter().map(|image| image.view()).collect();
    ndarray::stack(Axis(0), &views)
        .map_err(|e| CameraError::RunFile(format!("cannot stack images of different shapes: {}", e)))
}

/// Reader/writer of a persisted run file.
pub trait RunFile {
    /// Load the group of `device_name`.
    fn device_group(&self, device_name: &str) -> AppResult<DeviceGroup>;

    /// Write the images (and saved attributes) of a finished shot.
    fn save_shot(&mut self, device_name: &str, shot: &ShotImages) -> AppResult<()>;

    /// Location of the file.
    fn path(&self) -> &Path;
}

/// Open a run file, choosing the backend by extension.
pub fn open(path: &Path) -> AppResult<Box<dyn RunFile>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("h5") | Some("hdf5") => open_hdf5(path),
        _ => Ok(Box::new(JsonRunFile::open(path)?)),
    }
}

#[cfg(feature = "storage_hdf5")]
fn open_hdf5(path: &Path) -> AppResult<Box<dyn RunFile>> {
    Ok(Box::new(hdf5_backend::Hdf5RunFile::open(path)?))
}

#[cfg(not(feature = "storage_hdf5"))]
fn open_hdf5(_path: &Path) -> AppResult<Box<dyn RunFile>> {
    Err(CameraError::FeatureNotEnabled("storage_hdf5".to_string()))
}

/// JSON run file:
///
/// ```json
/// {"devices": {"andor": {"EXPOSURES": [["img", "atoms", 0.1, 0.001, null]],
///                        "device_properties": {"camera_attributes": {}}}}}
/// ```
#[derive(Debug, Clone)]
pub struct JsonRunFile {
    path: PathBuf,
    document: Value,
}

impl JsonRunFile {
    /// Empty document, written on [`save`](Self::save).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: json!({ "devices": {} }),
        }
    }

    /// Read the run file at `path`.
    pub fn open(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&text)?;
        if !document.is_object() {
            return Err(CameraError::RunFile(format!(
                "{}: top level is not an object",
                path.display()
            )));
        }
        debug!("Opened run file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            document,
        })
    }

    /// Parsed document.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Add or replace a device group. `exposures = None` leaves out the table.
    pub fn set_device(
        &mut self,
        device_name: &str,
        exposures: Option<&[ExposureRecord]>,
        properties: &DeviceProperties,
    ) -> AppResult<()> {
        let mut group = Map::new();
        if let Some(records) = exposures {
            let rows: Vec<Value> = records.iter().map(|r| Value::Array(r.to_fields())).collect();
            group.insert("EXPOSURES".to_string(), Value::Array(rows));
        }
        group.insert("device_properties".to_string(), serde_json::to_value(properties)?);
        object_entry(&mut self.document, "devices")?.insert(device_name.to_string(), Value::Object(group));
        Ok(())
    }

    /// Write the document back to disk.
    pub fn save(&self) -> AppResult<()> {
        fs::write(&self.path, serde_json::to_string_pretty(&self.document)?)?;
        Ok(())
    }
}

fn object_entry<'a>(document: &'a mut Value, key: &str) -> AppResult<&'a mut Map<String, Value>> {
    let root = document
        .as_object_mut()
        .ok_or_else(|| CameraError::RunFile("run file root is not an object".to_string()))?;
    root.entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| CameraError::RunFile(format!("'{}' is not a group", key)))
}

impl RunFile for JsonRunFile {
    fn device_group(&self, device_name: &str) -> AppResult<DeviceGroup> {
        let group = self
            .document
            .get("devices")
            .and_then(|devices| devices.get(device_name))
            .ok_or_else(|| {
                CameraError::RunFile(format!("no group for device '{}' in run file", device_name))
            })?;

        let exposures = match group.get("EXPOSURES") {
            None | Some(Value::Null) => None,
            Some(rows) => {
                let rows: Vec<Vec<Value>> = serde_json::from_value(rows.clone())?;
                Some(ExposureTable::from_rows(&rows)?)
            }
        };
        let properties = match group.get("device_properties") {
            Some(props) => serde_json::from_value(props.clone())?,
            None => DeviceProperties::default(),
        };

        Ok(DeviceGroup {
            exposures,
            properties,
        })
    }

    fn save_shot(&mut self, device_name: &str, shot: &ShotImages) -> AppResult<()> {
        let mut frames = Map::new();
        for group in &shot.groups {
            let stacked = stack_images(&group.images)?;
            let entry = frames
                .entry(group.name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(by_type) = entry {
                by_type.insert(
                    group.frame_type.clone(),
                    json!({ "shape": stacked.shape(), "data": stacked.iter().collect::<Vec<_>>() }),
                );
            }
        }

        let mut saved = Map::new();
        saved.insert("saved_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
        saved.insert("failed_shot".to_string(), json!(shot.failed_shot));
        if let Some(attributes) = &shot.attributes {
            saved.insert("camera_attributes".to_string(), serde_json::to_value(attributes)?);
        }
        saved.insert("frames".to_string(), Value::Object(frames));

        object_entry(&mut self.document, "images")?.insert(device_name.to_string(), Value::Object(saved));
        self.save()?;
        info!(
            "Saved {} image(s) for '{}' to {}",
            shot.image_count(),
            device_name,
            self.path.display()
        );
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "storage_hdf5")]
pub mod hdf5_backend {
    //! HDF5 run files: `EXPOSURES` is a 2-D variable-length string dataset and
    //! `device_properties` a JSON string attribute on the device group.

    use std::path::{Path, PathBuf};

    use hdf5::types::VarLenUnicode;
    use hdf5::{File, Group};
    use serde_json::Value;
    use tracing::info;

    use super::{stack_images, DeviceGroup, DeviceProperties, ExposureTable, RunFile, ShotImages};
    use crate::error::{AppResult, CameraError};

    /// Run file stored as HDF5.
    pub struct Hdf5RunFile {
        path: PathBuf,
        file: File,
    }

    impl Hdf5RunFile {
        /// Open the file at `path` for reading and writing.
        pub fn open(path: &Path) -> AppResult<Self> {
            Ok(Self {
                path: path.to_path_buf(),
                file: File::open_rw(path)?,
            })
        }
    }

    fn unicode(text: &str) -> AppResult<VarLenUnicode> {
        text.parse()
            .map_err(|e| CameraError::RunFile(format!("cannot store string in HDF5: {}", e)))
    }

    fn child_group(parent: &Group, name: &str) -> AppResult<Group> {
        if parent.link_exists(name) {
            Ok(parent.group(name)?)
        } else {
            Ok(parent.create_group(name)?)
        }
    }

    fn write_string_attr(group: &Group, name: &str, text: &str) -> AppResult<()> {
        group
            .new_attr::<VarLenUnicode>()
            .create(name)?
            .write_scalar(&unicode(text)?)?;
        Ok(())
    }

    impl RunFile for Hdf5RunFile {
        fn device_group(&self, device_name: &str) -> AppResult<DeviceGroup> {
            let group = self.file.group(&format!("devices/{}", device_name))?;

            let exposures = if group.link_exists("EXPOSURES") {
                let table = group.dataset("EXPOSURES")?.read_2d::<VarLenUnicode>()?;
                let rows: Vec<Vec<Value>> = table
                    .outer_iter()
                    .map(|row| row.iter().map(|cell| Value::String(cell.to_string())).collect())
                    .collect();
                Some(ExposureTable::from_rows(&rows)?)
            } else {
                None
            };

            let properties = match group.attr("device_properties") {
                Ok(attr) => {
                    let text = attr.read_scalar::<VarLenUnicode>()?;
                    serde_json::from_str(text.as_str())?
                }
                Err(_) => DeviceProperties::default(),
            };

            Ok(DeviceGroup {
                exposures,
                properties,
            })
        }

        fn save_shot(&mut self, device_name: &str, shot: &ShotImages) -> AppResult<()> {
            let images = child_group(&self.file, "images")?;
            let device = child_group(&images, device_name)?;

            for group in &shot.groups {
                let by_name = child_group(&device, &group.name)?;
                let stacked = stack_images(&group.images)?;
                by_name
                    .new_dataset_builder()
                    .with_data(&stacked)
                    .create(group.frame_type.as_str())?;
            }
            if let Some(attributes) = &shot.attributes {
                write_string_attr(&device, "camera_attributes", &serde_json::to_string(attributes)?)?;
            }
            write_string_attr(&device, "saved_at", &chrono::Utc::now().to_rfc3339())?;
            device
                .new_attr::<bool>()
                .create("failed_shot")?
                .write_scalar(&shot.failed_shot)?;
            self.file.flush()?;

            info!(
                "Saved {} image(s) for '{}' to {}",
                shot.image_count(),
                device_name,
                self.path.display()
            );
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }
}
