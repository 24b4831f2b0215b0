use std::{
    fmt,
    str::FromStr,
    sync::{PoisonError, RwLock},
};

use crate::camera::args::{ArgMap, ArgValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsKind {
    Camera,
    Preview,
    Photo,
    Vid,
    Stream,
    Motion,
}

impl SettingsKind {
    pub const ALL: [SettingsKind; 6] = [
        SettingsKind::Camera,
        SettingsKind::Preview,
        SettingsKind::Photo,
        SettingsKind::Vid,
        SettingsKind::Stream,
        SettingsKind::Motion,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SettingsKind::Camera => "camera",
            SettingsKind::Preview => "preview",
            SettingsKind::Photo => "photo",
            SettingsKind::Vid => "vid",
            SettingsKind::Stream => "stream",
            SettingsKind::Motion => "motion",
        }
    }
}

impl fmt::Display for SettingsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SettingsKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SettingsKind::ALL
            .into_iter()
            .find(|kind| kind.name() == value)
            .ok_or_else(|| format!("unknown settings group: {value}"))
    }
}

/// User values layered over defaults. Values are not validated here; the
/// capture programs reject what they do not understand.
#[derive(Debug, Clone, Default)]
pub struct SettingsGroup {
    defaults: ArgMap,
    values: ArgMap,
}

impl SettingsGroup {
    pub fn with_defaults<const N: usize>(defaults: [(&str, ArgValue); N]) -> Self {
        Self {
            defaults: defaults
                .into_iter()
                .map(|(key, value)| (key.to_owned(), Some(value)))
                .collect(),
            values: ArgMap::new(),
        }
    }

    pub fn convert(&self) -> ArgMap {
        let mut merged = self.defaults.clone();
        for (key, value) in &self.values {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Applies an update, `None` values reset a key to its default. Returns
    /// whether anything changed.
    pub fn apply(&mut self, update: ArgMap) -> bool {
        let mut changed = false;
        for (key, value) in update {
            match value {
                None => changed |= self.values.shift_remove(&key).is_some(),
                Some(value) => {
                    let next = Some(value);
                    if self.values.get(&key) != Some(&next) {
                        self.values.insert(key, next);
                        changed = true;
                    }
                }
            }
        }
        changed
    }
}

/// Materialized copy of every group, handed to the mode resolver.
#[derive(Debug, Clone, Default)]
pub struct SettingsSnapshot {
    pub camera: ArgMap,
    pub preview: ArgMap,
    pub photo: ArgMap,
    pub vid: ArgMap,
    pub stream: ArgMap,
    pub motion: ArgMap,
}

impl SettingsSnapshot {
    pub fn motion_enabled(&self) -> bool {
        matches!(self.motion.get("enabled"), Some(Some(ArgValue::Bool(true))))
    }
}

#[derive(Debug, Clone)]
struct Groups {
    camera: SettingsGroup,
    preview: SettingsGroup,
    photo: SettingsGroup,
    vid: SettingsGroup,
    stream: SettingsGroup,
    motion: SettingsGroup,
}

impl Groups {
    fn get(&self, kind: SettingsKind) -> &SettingsGroup {
        match kind {
            SettingsKind::Camera => &self.camera,
            SettingsKind::Preview => &self.preview,
            SettingsKind::Photo => &self.photo,
            SettingsKind::Vid => &self.vid,
            SettingsKind::Stream => &self.stream,
            SettingsKind::Motion => &self.motion,
        }
    }

    fn get_mut(&mut self, kind: SettingsKind) -> &mut SettingsGroup {
        match kind {
            SettingsKind::Camera => &mut self.camera,
            SettingsKind::Preview => &mut self.preview,
            SettingsKind::Photo => &mut self.photo,
            SettingsKind::Vid => &mut self.vid,
            SettingsKind::Stream => &mut self.stream,
            SettingsKind::Motion => &mut self.motion,
        }
    }
}

impl Default for Groups {
    fn default() -> Self {
        Self {
            camera: SettingsGroup::default(),
            preview: SettingsGroup::with_defaults([("nopreview", true.into())]),
            photo: SettingsGroup::with_defaults([("encoding", "jpg".into())]),
            vid: SettingsGroup::default(),
            stream: SettingsGroup::with_defaults([
                ("width", 1280_i64.into()),
                ("height", 720_i64.into()),
                ("framerate", 25_i64.into()),
                ("codec", "H264".into()),
                ("bitrate", 10_000_000_i64.into()),
                ("intra", 60_i64.into()),
                ("profile", "baseline".into()),
                ("level", "4".into()),
            ]),
            motion: SettingsGroup::with_defaults([("enabled", false.into())]),
        }
    }
}

#[derive(Debug, Default)]
pub struct SettingsStore {
    groups: RwLock<Groups>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, kind: SettingsKind) -> ArgMap {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(kind).convert()
    }

    pub fn apply(&self, kind: SettingsKind, update: ArgMap) -> bool {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups.get_mut(kind).apply(update)
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        SettingsSnapshot {
            camera: groups.camera.convert(),
            preview: groups.preview.convert(),
            photo: groups.photo.convert(),
            vid: groups.vid.convert(),
            stream: groups.stream.convert(),
            motion: groups.motion.convert(),
        }
    }
}
