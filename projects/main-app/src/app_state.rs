use std::sync::Arc;

use crate::{
    camera::{
        control::{CameraControl, ControlOptions},
        libcamera_backend::LibcameraBackend,
        modes::CaptureLayout,
    },
    config::AppConfig,
    settings::SettingsStore,
    watcher::FileWatcher,
};

pub struct AppState {
    pub config: AppConfig,
    pub control: Arc<CameraControl<LibcameraBackend>>,
    pub settings: Arc<SettingsStore>,
    pub watcher: FileWatcher,
}

impl AppState {
    /// Starts the camera control, which launches the live stream immediately.
    pub fn new(config: AppConfig) -> Self {
        let settings = Arc::new(SettingsStore::new());
        let backend = Arc::new(LibcameraBackend::new(config.capture_binary_prefix.clone()));
        let control = CameraControl::launch(
            backend,
            settings.clone(),
            ControlOptions {
                layout: CaptureLayout {
                    captures_dir: config.captures_dir.clone(),
                    motions_prefix: config.motions_prefix.clone(),
                },
                settle_timeout: config.settle_timeout,
                output_capacity: config.stream_buffer_chunks,
            },
        );
        let watcher = FileWatcher::new(config.captures_dir.clone());

        Self {
            config,
            control,
            settings,
            watcher,
        }
    }
}
