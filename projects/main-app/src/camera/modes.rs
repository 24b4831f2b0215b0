use std::path::PathBuf;

use chrono::{DateTime, Local};

use super::{
    args::{ArgMap, ArgValue},
    traits::Program,
};
use crate::{core::state::Mode, settings::SettingsSnapshot};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
const CIRCULAR_BUFFER_MB: i64 = 40;
const LORES_WIDTH: i64 = 128;
const LORES_HEIGHT: i64 = 96;
const MOTION_POST_PROCESS_FILE: &str = "./motion_detect.json";

/// A fully resolved launch request: which program, with which settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: Program,
    pub arguments: ArgMap,
}

/// Where file-producing modes write.
#[derive(Debug, Clone)]
pub struct CaptureLayout {
    pub captures_dir: PathBuf,
    pub motions_prefix: String,
}

pub fn resolve(mode: Mode, settings: &SettingsSnapshot, layout: &CaptureLayout) -> ProcessSpec {
    resolve_at(mode, settings, layout, Local::now())
}

pub fn resolve_at(
    mode: Mode,
    settings: &SettingsSnapshot,
    layout: &CaptureLayout,
    now: DateTime<Local>,
) -> ProcessSpec {
    let timestamp = now.format(TIMESTAMP_FORMAT).to_string();

    match mode {
        Mode::Photo => {
            let mut arguments = layered(&[&settings.camera, &settings.preview, &settings.photo]);
            let encoding = match arguments.get("encoding") {
                Some(Some(ArgValue::Text(encoding))) if !encoding.is_empty() => encoding.clone(),
                _ => "jpg".to_owned(),
            };
            let output = layout
                .captures_dir
                .join(format!("{timestamp}-%04d.{encoding}"));
            arguments.insert(
                "output".to_owned(),
                Some(output.to_string_lossy().into_owned().into()),
            );
            ProcessSpec {
                program: Program::Still,
                arguments,
            }
        }
        Mode::Video => {
            let mut arguments = layered(&[&settings.camera, &settings.preview, &settings.vid]);
            let output = layout.captures_dir.join(format!("{timestamp}.h264"));
            arguments.insert(
                "output".to_owned(),
                Some(output.to_string_lossy().into_owned().into()),
            );
            ProcessSpec {
                program: Program::Vid,
                arguments,
            }
        }
        Mode::Stream => resolve_stream(settings),
    }
}

/// The continuous preview feed, written to stdout.
pub fn resolve_stream(settings: &SettingsSnapshot) -> ProcessSpec {
    let mut arguments = layered(&[&settings.camera, &settings.preview, &settings.stream]);
    fix(&mut arguments, "profile", "baseline".into());
    fix(&mut arguments, "inline", true.into());
    fix(&mut arguments, "circular", CIRCULAR_BUFFER_MB.into());
    fix(&mut arguments, "output", "-".into());
    fix(&mut arguments, "lores-width", LORES_WIDTH.into());
    fix(&mut arguments, "lores-height", LORES_HEIGHT.into());

    ProcessSpec {
        program: Program::Vid,
        arguments,
    }
}

/// The motion detector that runs alongside the stream, `None` while the
/// motion group is disabled.
pub fn resolve_motion(settings: &SettingsSnapshot, layout: &CaptureLayout) -> Option<ProcessSpec> {
    if !settings.motion_enabled() {
        return None;
    }

    let mut arguments = layered(&[&settings.camera, &settings.preview, &settings.motion]);
    arguments.shift_remove("enabled");
    fix(
        &mut arguments,
        "motion-output",
        layout.motions_prefix.clone().into(),
    );
    fix(&mut arguments, "lores-width", LORES_WIDTH.into());
    fix(&mut arguments, "lores-height", LORES_HEIGHT.into());
    fix(
        &mut arguments,
        "post-process-file",
        MOTION_POST_PROCESS_FILE.into(),
    );

    Some(ProcessSpec {
        program: Program::Motion,
        arguments,
    })
}

fn layered(layers: &[&ArgMap]) -> ArgMap {
    let mut merged = ArgMap::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn fix(arguments: &mut ArgMap, key: &str, value: ArgValue) {
    arguments.insert(key.to_owned(), Some(value));
}
