use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where the engine reads its media from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InputType {
    /// RTMP feed pushed by a DJI controller into the local relay.
    DjiRtmp,
    /// Video4Linux capture device.
    UsbCam,
    /// A selector this version does not understand. It survives a load/save
    /// cycle untouched and is rejected when an argv is built from it.
    Unknown(String),
}

impl From<String> for InputType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "dji_rtmp" => InputType::DjiRtmp,
            "usb_cam" => InputType::UsbCam,
            _ => InputType::Unknown(value),
        }
    }
}

impl From<InputType> for String {
    fn from(value: InputType) -> Self {
        match value {
            InputType::DjiRtmp => "dji_rtmp".to_owned(),
            InputType::UsbCam => "usb_cam".to_owned(),
            InputType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::DjiRtmp => f.write_str("dji_rtmp"),
            InputType::UsbCam => f.write_str("usb_cam"),
            InputType::Unknown(other) => f.write_str(other),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    Panic,
    Fatal,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Quiet => "quiet",
            LogLevel::Panic => "panic",
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodePolicy {
    Copy,
    Reencode {
        codec: String,
        preset: String,
        bitrate: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AudioPolicy {
    Copy,
    Reencode { codec: String, bitrate: String },
    Disabled,
}

/// Everything needed to build one engine invocation.
///
/// The field names are the keys of the persisted JSON object. Any key missing
/// from a persisted object takes its default, and keys this version does not
/// know about are carried along in `extra` so they are written back on save.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub input_type: InputType,

    /// Stream key the DJI controller publishes under on the relay.
    pub dji_stream_key: String,

    pub usb_device: String,
    /// Pixel format requested from the capture device. `mjpeg` is what most
    /// USB cameras offer at 720p; `yuyv422` is the usual fallback.
    pub usb_input_format: String,
    pub usb_resolution: String,
    pub usb_framerate: String,
    /// ALSA device such as `hw:1,0`. Empty means no separate audio input.
    pub usb_audio_device: String,
    pub disable_usb_audio: bool,

    /// Destination URL, passed to the engine unmodified.
    pub output_rtsp_url: String,

    #[serde(rename = "ffmpeg_loglevel")]
    pub log_level: LogLevel,

    pub re_encode_video: bool,
    pub video_codec: String,
    pub video_preset: String,
    pub video_bitrate: String,

    pub audio_codec: String,
    pub audio_bitrate: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            input_type: InputType::DjiRtmp,
            dji_stream_key: "dji_stream".to_owned(),
            usb_device: "/dev/video0".to_owned(),
            usb_input_format: "mjpeg".to_owned(),
            usb_resolution: "1280x720".to_owned(),
            usb_framerate: "30".to_owned(),
            usb_audio_device: String::new(),
            disable_usb_audio: false,
            output_rtsp_url: "rtsp://your-target-rtsp-server:8554/mystream".to_owned(),
            log_level: LogLevel::Info,
            re_encode_video: false,
            video_codec: "libx264".to_owned(),
            video_preset: "ultrafast".to_owned(),
            video_bitrate: "2000k".to_owned(),
            audio_codec: "aac".to_owned(),
            audio_bitrate: "128k".to_owned(),
            extra: BTreeMap::new(),
        }
    }
}

impl StreamConfig {
    /// The video policy the operator asked for. The argv builder may still
    /// override `Copy` for sources whose raw format cannot be relayed.
    pub fn encode_policy(&self) -> EncodePolicy {
        if self.re_encode_video {
            EncodePolicy::Reencode {
                codec: self.video_codec.clone(),
                preset: self.video_preset.clone(),
                bitrate: self.video_bitrate.clone(),
            }
        } else {
            EncodePolicy::Copy
        }
    }

    /// The audio policy that applies to this source.
    ///
    /// Capture devices deliver raw PCM, so their audio is always re-encoded
    /// unless it is switched off. Relayed RTMP audio is only re-encoded
    /// together with the video.
    pub fn audio_policy(&self) -> AudioPolicy {
        let reencode = AudioPolicy::Reencode {
            codec: self.audio_codec.clone(),
            bitrate: self.audio_bitrate.clone(),
        };

        match self.input_type {
            InputType::UsbCam if self.disable_usb_audio => AudioPolicy::Disabled,
            InputType::UsbCam => reencode,
            _ if self.re_encode_video => reencode,
            _ => AudioPolicy::Copy,
        }
    }

    /// Overlays `patch` on top of this configuration. Keys in the patch
    /// replace the current values; everything else is kept.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<StreamConfig, serde_json::Error> {
        let mut current = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        for (key, value) in patch {
            current.insert(key.clone(), value.clone());
        }

        serde_json::from_value(Value::Object(current))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn partial_object_is_completed_with_defaults() {
        let config: StreamConfig = serde_json::from_value(json!({
            "input_type": "usb_cam",
            "usb_device": "/dev/video2",
        }))
        .unwrap();

        assert_eq!(config.input_type, InputType::UsbCam);
        assert_eq!(config.usb_device, "/dev/video2");
        assert_eq!(config.usb_resolution, "1280x720");
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.extra.is_empty());
    }

    #[test]
    fn unknown_selector_is_kept_verbatim() {
        let config: StreamConfig =
            serde_json::from_value(json!({ "input_type": "ndi" })).unwrap();
        assert_eq!(config.input_type, InputType::Unknown("ndi".to_owned()));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["input_type"], "ndi");
    }

    #[test]
    fn unknown_keys_survive_serialization() {
        let config: StreamConfig =
            serde_json::from_value(json!({ "overlay_text": "north field" })).unwrap();
        assert_eq!(config.extra["overlay_text"], json!("north field"));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["overlay_text"], "north field");
        assert_eq!(value["ffmpeg_loglevel"], "info");
    }

    #[test]
    fn merge_replaces_only_patched_keys() {
        let base = StreamConfig::default();
        let patch = json!({ "re_encode_video": true, "video_bitrate": "4000k" });

        let merged = base.merged(patch.as_object().unwrap()).unwrap();

        assert!(merged.re_encode_video);
        assert_eq!(merged.video_bitrate, "4000k");
        assert_eq!(merged.video_preset, base.video_preset);
        assert_eq!(merged.output_rtsp_url, base.output_rtsp_url);
    }

    #[test]
    fn merge_rejects_mistyped_values() {
        let patch = json!({ "re_encode_video": "sometimes" });
        assert!(StreamConfig::default()
            .merged(patch.as_object().unwrap())
            .is_err());
    }

    #[test]
    fn audio_policy_follows_source() {
        let mut config = StreamConfig::default();
        assert_eq!(config.audio_policy(), AudioPolicy::Copy);

        config.re_encode_video = true;
        assert!(matches!(config.audio_policy(), AudioPolicy::Reencode { .. }));

        config.input_type = InputType::UsbCam;
        config.re_encode_video = false;
        assert!(matches!(config.audio_policy(), AudioPolicy::Reencode { .. }));

        config.disable_usb_audio = true;
        assert_eq!(config.audio_policy(), AudioPolicy::Disabled);
    }
}
