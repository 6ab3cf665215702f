//! Durable record of which model and label map are active.
//!
//! Layout under the data directory:
//!
//! ```text
//! label_map.json          current vocabulary (name -> index)
//! training_state.json     active model code/file, last task id
//! models/custom_model_<code>.onnx
//! models/.staged_<code>.onnx   downloaded, not yet installed
//! ```
//!
//! All writes replace whole files atomically so a crash never leaves a
//! half-written label map or state record behind.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, labels::LabelMap};

pub const DEFAULT_MODEL_CODE: &str = "base_v1";

const LABEL_MAP_FILE: &str = "label_map.json";
const STATE_FILE: &str = "training_state.json";
const MODELS_DIR: &str = "models";
const MODEL_EXTENSION: &str = "onnx";

/// Writes `bytes` to a sibling temp file, syncs it, then renames it over
/// `path`. Readers see either the old or the new contents.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    let result = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Model codes come from the server; keep only filename-safe characters.
fn sanitize_model_code(code: &str) -> String {
    let cleaned: String = code
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    current_model_code: String,
    /// File name under `models/`; `None` means the bundled model.
    current_model_file: Option<String>,
    last_model_url: Option<String>,
    last_task_id: Option<String>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            current_model_code: DEFAULT_MODEL_CODE.to_string(),
            current_model_file: None,
            last_model_url: None,
            last_task_id: None,
        }
    }
}

/// The model the classifier should run, resolved against what is on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveModel {
    pub model_code: String,
    pub model_path: PathBuf,
    pub is_custom: bool,
}

#[derive(Clone, Debug)]
struct StorePaths {
    label_map: PathBuf,
    state: PathBuf,
    models_dir: PathBuf,
    bundled_model: PathBuf,
    bundled_labels: PathBuf,
}

pub struct ModelStore {
    paths: StorePaths,
    state: Mutex<PersistedState>,
}

impl ModelStore {
    /// Opens (or initializes) the store under `data_dir`, seeding the label
    /// map from the bundled default on first run.
    pub fn open(
        data_dir: &Path,
        bundled_model: &Path,
        bundled_labels: &Path,
    ) -> Result<Self, StoreError> {
        let paths = StorePaths {
            label_map: data_dir.join(LABEL_MAP_FILE),
            state: data_dir.join(STATE_FILE),
            models_dir: data_dir.join(MODELS_DIR),
            bundled_model: bundled_model.to_path_buf(),
            bundled_labels: bundled_labels.to_path_buf(),
        };
        fs::create_dir_all(&paths.models_dir).map_err(|source| StoreError::Write {
            path: paths.models_dir.clone(),
            source,
        })?;

        let state = read_state(&paths.state);
        let store = Self {
            paths,
            state: Mutex::new(state),
        };
        if !store.paths.label_map.is_file() {
            log::info!(
                "seeding label map from {}",
                store.paths.bundled_labels.display()
            );
            store.bundled_label_map()?.save(&store.paths.label_map)?;
        }
        Ok(store)
    }

    pub fn label_map_path(&self) -> &Path {
        &self.paths.label_map
    }

    pub fn bundled_model_path(&self) -> &Path {
        &self.paths.bundled_model
    }

    pub fn bundled_label_map(&self) -> Result<LabelMap, StoreError> {
        LabelMap::load(&self.paths.bundled_labels)
    }

    pub fn load_label_map(&self) -> Result<LabelMap, StoreError> {
        if !self.paths.label_map.is_file() {
            log::warn!("label map missing, restoring bundled default");
            let bundled = self.bundled_label_map()?;
            bundled.save(&self.paths.label_map)?;
            return Ok(bundled);
        }
        LabelMap::load(&self.paths.label_map)
    }

    pub fn current_model_code(&self) -> String {
        self.state.lock().current_model_code.clone()
    }

    pub fn last_task_id(&self) -> Option<String> {
        self.state.lock().last_task_id.clone()
    }

    /// Resolves the active model. A record pointing at a missing file is
    /// reset to the bundled default.
    pub fn active_model(&self) -> ActiveModel {
        let mut state = self.state.lock();
        if let Some(file) = state.current_model_file.clone() {
            let model_path = self.paths.models_dir.join(&file);
            if model_path.is_file() {
                return ActiveModel {
                    model_code: state.current_model_code.clone(),
                    model_path,
                    is_custom: true,
                };
            }

            log::warn!(
                "model {} recorded as active but {} is missing; using bundled model",
                state.current_model_code,
                model_path.display()
            );
            let next = PersistedState {
                current_model_code: DEFAULT_MODEL_CODE.to_string(),
                current_model_file: None,
                last_model_url: None,
                ..state.clone()
            };
            if let Err(err) = self.persist(&next) {
                log::warn!("failed to reset dangling model record: {err}");
            }
            *state = next;
        }

        ActiveModel {
            model_code: state.current_model_code.clone(),
            model_path: self.paths.bundled_model.clone(),
            is_custom: false,
        }
    }

    /// The file a committed `model_code` would be installed as. Never the
    /// active model's file, even when two codes sanitize to the same name.
    pub fn model_path_for(&self, model_code: &str) -> PathBuf {
        self.install_path_for(&self.state.lock(), model_code)
    }

    fn install_path_for(&self, state: &PersistedState, model_code: &str) -> PathBuf {
        let stem = format!("custom_model_{}", sanitize_model_code(model_code));
        let mut file = format!("{stem}.{MODEL_EXTENSION}");
        if state.current_model_file.as_deref() == Some(file.as_str()) {
            file = format!("{stem}_1.{MODEL_EXTENSION}");
        }
        self.paths.models_dir.join(file)
    }

    /// Stages a downloaded model binary. It gets its installed name only
    /// when [`ModelStore::commit`] succeeds.
    pub fn write_model(&self, model_code: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.paths.models_dir.join(format!(
            ".staged_{}.{MODEL_EXTENSION}",
            sanitize_model_code(model_code)
        ));
        write_atomic(&path, bytes).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        log::info!("staged model {model_code} at {}", path.display());
        Ok(path)
    }

    /// Installs the staged model and makes it active together with `labels`.
    /// Returns the installed path.
    ///
    /// Nothing changes if any step fails: the label map is written back, the
    /// installed file is removed and the record keeps the previous model.
    pub fn commit(
        &self,
        model_code: &str,
        staged: &Path,
        labels: &LabelMap,
        model_url: Option<&str>,
    ) -> Result<PathBuf, StoreError> {
        let mut state = self.state.lock();
        let previous_labels = LabelMap::load(&self.paths.label_map).ok();

        let model_path = self.install_path_for(&state, model_code);
        fs::rename(staged, &model_path).map_err(|source| StoreError::Write {
            path: model_path.clone(),
            source,
        })?;

        let next = PersistedState {
            current_model_code: model_code.to_string(),
            current_model_file: model_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            last_model_url: model_url.map(str::to_string),
            ..state.clone()
        };
        let written = labels
            .save(&self.paths.label_map)
            .and_then(|()| self.persist(&next));
        if let Err(err) = written {
            if let Some(previous) = previous_labels {
                if let Err(restore_err) = previous.save(&self.paths.label_map) {
                    log::error!("failed to restore previous label map: {restore_err}");
                }
            }
            if let Err(remove_err) = fs::remove_file(&model_path) {
                log::warn!("failed to remove {}: {remove_err}", model_path.display());
            }
            return Err(err);
        }
        *state = next;
        log::info!("model {model_code} installed at {}", model_path.display());
        Ok(model_path)
    }

    /// Removes a model file that never became active. The active model is
    /// never removed.
    pub fn discard_model(&self, path: &Path) {
        let is_active = {
            let state = self.state.lock();
            state
                .current_model_file
                .as_ref()
                .is_some_and(|file| self.paths.models_dir.join(file) == path)
        };
        if is_active {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => log::info!("discarded {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("failed to discard {}: {err}", path.display()),
        }
    }

    pub fn record_task_id(&self, task_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let next = PersistedState {
            last_task_id: Some(task_id.to_string()),
            ..state.clone()
        };
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    /// Drops every downloaded model, restores the bundled label map and
    /// points the record back at the bundled model.
    pub fn reset(&self) -> Result<LabelMap, StoreError> {
        let mut state = self.state.lock();

        let bundled = self.bundled_label_map()?;
        bundled.save(&self.paths.label_map)?;

        let next = PersistedState {
            last_task_id: state.last_task_id.clone(),
            ..PersistedState::default()
        };
        self.persist(&next)?;
        *state = next;

        let entries = fs::read_dir(&self.paths.models_dir).map_err(|source| StoreError::Read {
            path: self.paths.models_dir.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to remove {}: {err}", path.display());
            }
        }
        log::info!("model store reset to {DEFAULT_MODEL_CODE}");
        Ok(bundled)
    }

    fn persist(&self, state: &PersistedState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Encode {
            path: self.paths.state.clone(),
            source,
        })?;
        write_atomic(&self.paths.state, &json).map_err(|source| StoreError::Write {
            path: self.paths.state.clone(),
            source,
        })
    }
}

fn read_state(path: &Path) -> PersistedState {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return PersistedState::default(),
        Err(err) => {
            log::warn!("failed to read {}: {err}; starting fresh", path.display());
            return PersistedState::default();
        }
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|err| {
        log::warn!("malformed {}: {err}; starting fresh", path.display());
        PersistedState::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        data: PathBuf,
        bundled_model: PathBuf,
        bundled_labels: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bundled_model = dir.path().join("basic_gesture_model.onnx");
            let bundled_labels = dir.path().join("basic_label_map.json");
            fs::write(&bundled_model, b"bundled").unwrap();
            fs::write(&bundled_labels, r#"{"none": 0, "fist": 1}"#).unwrap();
            Self {
                data: dir.path().join("data"),
                _dir: dir,
                bundled_model,
                bundled_labels,
            }
        }

        fn open(&self) -> ModelStore {
            ModelStore::open(&self.data, &self.bundled_model, &self.bundled_labels).unwrap()
        }
    }

    #[test]
    fn first_open_seeds_from_bundle() {
        let fx = Fixture::new();
        let store = fx.open();

        let active = store.active_model();
        assert_eq!(active.model_code, DEFAULT_MODEL_CODE);
        assert_eq!(active.model_path, fx.bundled_model);
        assert!(!active.is_custom);
        assert_eq!(store.load_label_map().unwrap().index_of("fist"), Some(1));
    }

    #[test]
    fn committed_model_survives_reopen() {
        let fx = Fixture::new();
        let store = fx.open();

        let staged = store.write_model("v2", b"weights").unwrap();
        let mut labels = store.load_label_map().unwrap();
        labels.append("rock");
        let path = store
            .commit("v2", &staged, &labels, Some("http://x/v2.onnx"))
            .unwrap();
        store.record_task_id("t1").unwrap();
        assert!(!staged.exists());
        assert_eq!(fs::read(&path).unwrap(), b"weights");
        drop(store);

        let reopened = fx.open();
        let active = reopened.active_model();
        assert_eq!(active.model_code, "v2");
        assert_eq!(active.model_path, path);
        assert!(active.is_custom);
        assert_eq!(reopened.load_label_map().unwrap().index_of("rock"), Some(2));
        assert_eq!(reopened.last_task_id().as_deref(), Some("t1"));
    }

    #[test]
    fn dangling_record_falls_back_to_bundled_model() {
        let fx = Fixture::new();
        let store = fx.open();
        let staged = store.write_model("v3", b"weights").unwrap();
        let path = store
            .commit("v3", &staged, &store.load_label_map().unwrap(), None)
            .unwrap();
        fs::remove_file(&path).unwrap();

        let active = store.active_model();
        assert!(!active.is_custom);
        assert_eq!(active.model_code, DEFAULT_MODEL_CODE);
        assert_eq!(store.current_model_code(), DEFAULT_MODEL_CODE);
    }

    #[test]
    fn discard_spares_the_active_model() {
        let fx = Fixture::new();
        let store = fx.open();
        let staged = store.write_model("v2", b"a").unwrap();
        let active = store
            .commit("v2", &staged, &store.load_label_map().unwrap(), None)
            .unwrap();
        let orphan = store.write_model("v3", b"b").unwrap();

        store.discard_model(&active);
        store.discard_model(&orphan);
        assert!(active.is_file());
        assert!(!orphan.exists());
    }

    #[test]
    fn reset_restores_bundled_state() {
        let fx = Fixture::new();
        let store = fx.open();
        let staged = store.write_model("v2", b"weights").unwrap();
        let mut labels = store.load_label_map().unwrap();
        labels.append("rock");
        let path = store.commit("v2", &staged, &labels, None).unwrap();
        store.write_model("v3", b"pending").unwrap();

        let restored = store.reset().unwrap();
        assert_eq!(restored, store.bundled_label_map().unwrap());
        assert_eq!(store.load_label_map().unwrap(), restored);
        assert_eq!(store.current_model_code(), DEFAULT_MODEL_CODE);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(fx.data.join(MODELS_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn colliding_codes_never_replace_the_active_file() {
        let fx = Fixture::new();
        let store = fx.open();
        let staged = store.write_model("v2.1", b"first").unwrap();
        let first = store
            .commit("v2.1", &staged, &store.load_label_map().unwrap(), None)
            .unwrap();

        let next = store.model_path_for("v2_1");
        assert_ne!(next, first);
        let staged = store.write_model("v2_1", b"second").unwrap();
        assert_eq!(fs::read(&first).unwrap(), b"first");

        store.discard_model(&staged);
        assert!(!staged.exists());
        assert_eq!(fs::read(&first).unwrap(), b"first");
        let active = store.active_model();
        assert_eq!(active.model_code, "v2.1");
        assert_eq!(active.model_path, first);

        let staged = store.write_model("v2_1", b"second").unwrap();
        let second = store
            .commit("v2_1", &staged, &store.load_label_map().unwrap(), None)
            .unwrap();
        assert_eq!(second, next);
        assert_eq!(fs::read(&first).unwrap(), b"first");
        assert_eq!(store.active_model().model_path, second);
    }

    #[test]
    fn failed_commit_keeps_previous_labels_and_model() {
        let fx = Fixture::new();
        let store = fx.open();
        let before = store.load_label_map().unwrap();

        // A directory where the state file belongs makes the rename fail.
        fs::create_dir_all(fx.data.join(STATE_FILE).join("blocked")).unwrap();

        let staged = store.write_model("v2", b"weights").unwrap();
        let mut labels = before.clone();
        labels.append("rock");
        let err = store.commit("v2", &staged, &labels, None).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));

        assert_eq!(store.load_label_map().unwrap(), before);
        assert_eq!(store.current_model_code(), DEFAULT_MODEL_CODE);
        assert!(!store.active_model().is_custom);
        assert!(!store.model_path_for("v2").exists());
    }

    #[test]
    fn model_codes_are_sanitized_into_file_names() {
        let fx = Fixture::new();
        let store = fx.open();
        let path = store.model_path_for("../v2/evil");
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "custom_model____v2_evil.onnx"
        );
        assert!(path.starts_with(fx.data.join(MODELS_DIR)));
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!temp_sibling(&path).exists());
    }
}
