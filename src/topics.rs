// Topic classification and payload wrapping. Topics look like
// `<prefix>/<version>/<category>/<device_id>`; the category is picked by
// substring search in a fixed order so a topic mentioning two categories
// always resolves the same way.
use std::fmt;

use crate::error::{GatewayError, Result};

/// Minimum number of `/`-delimited segments an incoming topic must carry.
pub const TOPIC_SEGMENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Settings,
    Image,
    Video,
    Audio,
}

impl Category {
    /// Classification order. The first keyword found in a topic wins.
    pub const PRECEDENCE: [Category; 4] = [
        Category::Settings,
        Category::Image,
        Category::Video,
        Category::Audio,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Category::Settings => "settings",
            Category::Image => "image",
            Category::Video => "video",
            Category::Audio => "audio",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Split a topic into its device id and category.
///
/// The keyword search runs over the whole topic string, not just the
/// category segment, so `afm/v1/settings-image/dev1` is a settings topic.
// TODO: match the keyword against the third segment only once every device
// firmware publishes on the exact category segment.
pub fn classify(topic: &str) -> Result<(String, Category)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < TOPIC_SEGMENTS {
        return Err(GatewayError::ParseFailure {
            topic: topic.to_string(),
            expected: TOPIC_SEGMENTS,
            found: parts.len(),
        });
    }

    let device_id = parts[parts.len() - 1];
    if device_id.is_empty() {
        return Err(GatewayError::EmptyDeviceId(topic.to_string()));
    }
    let device_id = device_id.to_string();

    Category::PRECEDENCE
        .into_iter()
        .find(|c| topic.contains(c.keyword()))
        .map(|category| (device_id, category))
        .ok_or_else(|| GatewayError::UnrecognizedCategory(topic.to_string()))
}

/// Decoded device message. Every variant carries the device id taken from the
/// topic and the payload bytes exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceData {
    Settings { device_id: String, payload: Vec<u8> },
    Image { device_id: String, payload: Vec<u8> },
    Video { device_id: String, payload: Vec<u8> },
    Audio { device_id: String, payload: Vec<u8> },
}

impl DeviceData {
    pub fn new(category: Category, device_id: String, payload: Vec<u8>) -> Self {
        match category {
            Category::Settings => DeviceData::Settings { device_id, payload },
            Category::Image => DeviceData::Image { device_id, payload },
            Category::Video => DeviceData::Video { device_id, payload },
            Category::Audio => DeviceData::Audio { device_id, payload },
        }
    }

    pub fn category(&self) -> Category {
        match self {
            DeviceData::Settings { .. } => Category::Settings,
            DeviceData::Image { .. } => Category::Image,
            DeviceData::Video { .. } => Category::Video,
            DeviceData::Audio { .. } => Category::Audio,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            DeviceData::Settings { device_id, .. }
            | DeviceData::Image { device_id, .. }
            | DeviceData::Video { device_id, .. }
            | DeviceData::Audio { device_id, .. } => device_id,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            DeviceData::Settings { payload, .. }
            | DeviceData::Image { payload, .. }
            | DeviceData::Video { payload, .. }
            | DeviceData::Audio { payload, .. } => payload,
        }
    }
}

/// Classify `topic` and wrap `payload` into the matching variant.
pub fn decode_message(topic: &str, payload: Vec<u8>) -> Result<DeviceData> {
    let (device_id, category) = classify(topic)?;
    Ok(DeviceData::new(category, device_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_topics_fail_to_parse() {
        for topic in ["", "afm", "afm/v1", "afm/v1/settings", "settings/image/video"] {
            match classify(topic) {
                Err(GatewayError::ParseFailure { found, .. }) => {
                    assert!(found < TOPIC_SEGMENTS, "topic {topic:?}")
                }
                other => panic!("expected ParseFailure for {topic:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_classify_each_category() {
        let cases = [
            ("afm/v1/settings/dev1", Category::Settings),
            ("afm/v1/image/dev1", Category::Image),
            ("afm/v1/video/dev1", Category::Video),
            ("afm/v1/audio/dev1", Category::Audio),
        ];
        for (topic, expected) in cases {
            let (device_id, category) = classify(topic).expect("classify");
            assert_eq!(device_id, "dev1");
            assert_eq!(category, expected, "topic {topic}");
        }
    }

    #[test]
    fn test_precedence_is_fixed() {
        let (_, category) = classify("afm/v1/settings-image/dev1").unwrap();
        assert_eq!(category, Category::Settings);

        let (_, category) = classify("afm/v1/audio-video-image/dev1").unwrap();
        assert_eq!(category, Category::Image);

        // Keyword in the prefix still counts.
        let (_, category) = classify("video/v1/audio/dev1").unwrap();
        assert_eq!(category, Category::Video);
    }

    #[test]
    fn test_device_id_is_last_segment() {
        let (device_id, _) = classify("afm/v1/image/extra/cam-42").unwrap();
        assert_eq!(device_id, "cam-42");
    }

    #[test]
    fn test_empty_device_id_is_rejected() {
        for topic in ["afm/v1/settings/", "afm/v1/image/dev1/"] {
            assert!(
                matches!(classify(topic), Err(GatewayError::EmptyDeviceId(ref t)) if t == topic),
                "topic {topic:?}"
            );
        }
    }

    #[test]
    fn test_unrecognized_category() {
        let err = classify("afm/v1/telemetry/dev1").unwrap_err();
        assert!(matches!(err, GatewayError::UnrecognizedCategory(t) if t == "afm/v1/telemetry/dev1"));
    }

    #[test]
    fn test_decode_message_keeps_payload() {
        let payload = vec![0u8, 159, 146, 150];
        let data = decode_message("afm/v1/video/dev9", payload.clone()).unwrap();
        assert_eq!(data.category(), Category::Video);
        assert_eq!(data.device_id(), "dev9");
        assert_eq!(data.payload(), payload.as_slice());
        assert_eq!(
            data,
            DeviceData::Video {
                device_id: "dev9".to_string(),
                payload
            }
        );
    }
}
