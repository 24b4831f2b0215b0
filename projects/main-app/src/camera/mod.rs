pub mod args;
pub mod control;
pub mod libcamera_backend;
pub mod modes;
pub mod supervisor;
pub mod traits;
