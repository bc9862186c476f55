// crates/playback-types/src/config.rs
//
// Config: everything an embedder can tune about how a session is opened and
// decoded. Serializable so it can be loaded from JSON/TOML the way the
// editor's timeline/library state is (see the sibling NLE crate this
// workspace grew out of), though playback-engine only ever needs the struct
// itself — serde is an ambient convenience, not a requirement of the core.

use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    None,
    Auto,
    /// A specific FFmpeg `AVHWDeviceType` ordinal, passed through unmapped so
    /// any device type the linked FFmpeg build supports can be selected
    /// without the crate hand-enumerating a backend list.
    Specific(i32),
}

impl Default for HwAccel {
    fn default() -> Self {
        HwAccel::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoOutFormat {
    /// Whatever format the decoder (or HW-to-system-memory transfer) produces.
    Native,
    Rgba,
    Yuv420p,
}

impl Default for VideoOutFormat {
    fn default() -> Self {
        VideoOutFormat::Native
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreBufferConfig {
    pub enabled: bool,
    pub video_frames: u32,
    pub audio_packets: u32,
    pub require_both_streams: bool,
}

impl Default for PreBufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            video_frames: 0,
            audio_packets: 0,
            require_both_streams: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub enable_frame_rate_control: bool,
    pub speed: f64,
    pub hw_accel: HwAccel,
    pub hw_device_index: i32,
    pub video_out_format: VideoOutFormat,
    pub require_frame_in_system_memory: bool,
    pub enable_auto_reconnect: bool,
    /// -1 = infinite.
    pub max_reconnect_attempts: i32,
    pub reconnect_interval_ms: u64,
    pub pre_buffer: PreBufferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_frame_rate_control: true,
            speed: 1.0,
            hw_accel: HwAccel::default(),
            hw_device_index: 0,
            video_out_format: VideoOutFormat::default(),
            require_frame_in_system_memory: true,
            enable_auto_reconnect: false,
            max_reconnect_attempts: -1,
            reconnect_interval_ms: 1000,
            pre_buffer: PreBufferConfig::default(),
        }
    }
}

impl Config {
    /// Surfaces an invalid configuration up front rather than only at the
    /// point a rejected `set_speed` call would otherwise reveal it.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.speed > 0.0) {
            return Err(Error::ConfigInvalid {
                reason: format!("speed must be > 0, got {}", self.speed),
            });
        }
        if self.pre_buffer.enabled
            && self.pre_buffer.video_frames == 0
            && self.pre_buffer.audio_packets == 0
        {
            return Err(Error::ConfigInvalid {
                reason: "pre_buffer.enabled requires a non-zero video_frames or audio_packets threshold".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_speed_is_invalid() {
        let mut cfg = Config::default();
        cfg.speed = 0.0;
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn negative_speed_is_invalid() {
        let mut cfg = Config::default();
        cfg.speed = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn prebuffer_with_no_thresholds_is_invalid() {
        let mut cfg = Config::default();
        cfg.pre_buffer.enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = Config::default();
        cfg.hw_accel = HwAccel::Specific(4);
        cfg.pre_buffer = PreBufferConfig { enabled: true, video_frames: 30, audio_packets: 50, require_both_streams: true };

        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
