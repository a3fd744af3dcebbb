//! Record checks applied before anything reaches the store.
//!
//! Two entry points cover the two shapes data arrives in: an untyped JSON
//! document (`payload_json` column, collaborator output) and an already typed
//! [`ContextPayload`]. Both normalise text and return the cleaned payload, or
//! the first rule that failed.

use serde_json::{Map, Value};

use crate::db::models::{
    BoundingBox, CaptionPayload, ContextPayload, ContextRecord, ContextType, DetectedObject,
    DetectionPayload, FramePayload, MetadataPayload, TranscriptPayload,
};
use crate::error::ValidationError;

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Check a whole record: video id, timestamp and payload.
///
/// Transcript segments get their record timestamp pinned to `start`.
pub fn validate_record(mut record: ContextRecord) -> ValidationResult<ContextRecord> {
    if record.video_id.trim().is_empty() {
        return Err(ValidationError::new("video_id", "must not be empty"));
    }
    check_timestamp("timestamp", record.timestamp)?;

    record.payload = validate_payload(record.payload)?;
    if let ContextPayload::TranscriptSegment(segment) = &record.payload {
        record.timestamp = segment.start;
    }
    Ok(record)
}

pub fn validate_payload(payload: ContextPayload) -> ValidationResult<ContextPayload> {
    match payload {
        ContextPayload::Frame(frame) => validate_frame(frame).map(ContextPayload::Frame),
        ContextPayload::Caption(caption) => validate_caption(caption).map(ContextPayload::Caption),
        ContextPayload::TranscriptSegment(segment) => {
            validate_transcript(segment).map(ContextPayload::TranscriptSegment)
        }
        ContextPayload::ObjectDetection(detection) => {
            validate_detection(detection).map(ContextPayload::ObjectDetection)
        }
        ContextPayload::Metadata(metadata) => {
            validate_metadata(metadata).map(ContextPayload::Metadata)
        }
    }
}

/// Decode and check an untyped payload document of the given type.
pub fn validate_document(context_type: ContextType, document: &Value) -> ValidationResult<ContextPayload> {
    let object = document
        .as_object()
        .ok_or_else(|| ValidationError::new("payload", "must be a JSON object"))?;

    let payload = match context_type {
        ContextType::Frame => ContextPayload::Frame(FramePayload {
            image_path: require_str(object, "image_path")?,
            width: optional_dimension(object, "width")?,
            height: optional_dimension(object, "height")?,
        }),
        ContextType::Caption => ContextPayload::Caption(CaptionPayload {
            text: require_str(object, "text")?,
            confidence: require_number(object, "confidence")?,
            frame_path: optional_str(object, "frame_path")?,
        }),
        ContextType::TranscriptSegment => ContextPayload::TranscriptSegment(TranscriptPayload {
            start: require_number(object, "start")?,
            end: require_number(object, "end")?,
            text: require_str(object, "text")?,
            confidence: optional_number(object, "confidence")?,
        }),
        ContextType::ObjectDetection => ContextPayload::ObjectDetection(DetectionPayload {
            objects: parse_objects(object)?,
            image_path: optional_str(object, "image_path")?,
        }),
        ContextType::Metadata => ContextPayload::Metadata(MetadataPayload {
            duration: require_number(object, "duration")?,
            fps: require_number(object, "fps")?,
            width: require_dimension(object, "width")?,
            height: require_dimension(object, "height")?,
        }),
    };

    validate_payload(payload)
}

fn validate_frame(mut frame: FramePayload) -> ValidationResult<FramePayload> {
    frame.image_path = non_empty("image_path", &frame.image_path)?;
    if frame.width == Some(0) {
        return Err(ValidationError::new("width", "must be greater than 0"));
    }
    if frame.height == Some(0) {
        return Err(ValidationError::new("height", "must be greater than 0"));
    }
    Ok(frame)
}

fn validate_caption(mut caption: CaptionPayload) -> ValidationResult<CaptionPayload> {
    caption.text = non_empty("text", &caption.text)?;
    check_confidence("confidence", caption.confidence)?;
    Ok(caption)
}

fn validate_transcript(mut segment: TranscriptPayload) -> ValidationResult<TranscriptPayload> {
    check_timestamp("start", segment.start)?;
    if !segment.end.is_finite() || segment.end <= segment.start {
        return Err(ValidationError::new(
            "end",
            format!("must be greater than start ({})", segment.start),
        ));
    }
    segment.text = non_empty("text", &segment.text)?;
    if let Some(confidence) = segment.confidence {
        check_confidence("confidence", confidence)?;
    }
    Ok(segment)
}

fn validate_detection(mut detection: DetectionPayload) -> ValidationResult<DetectionPayload> {
    for (index, object) in detection.objects.iter_mut().enumerate() {
        let class_name = non_empty(&format!("objects[{index}].class_name"), &object.class_name)?;
        object.class_name = class_name.to_lowercase();
        check_confidence(&format!("objects[{index}].confidence"), object.confidence)?;
        if let Some(bbox) = &object.bbox {
            check_bbox(index, bbox)?;
        }
    }
    Ok(detection)
}

fn validate_metadata(metadata: MetadataPayload) -> ValidationResult<MetadataPayload> {
    if !metadata.duration.is_finite() || metadata.duration <= 0.0 {
        return Err(ValidationError::new("duration", "must be a finite number greater than 0"));
    }
    if !metadata.fps.is_finite() || metadata.fps <= 0.0 {
        return Err(ValidationError::new("fps", "must be a finite number greater than 0"));
    }
    if metadata.width == 0 {
        return Err(ValidationError::new("width", "must be greater than 0"));
    }
    if metadata.height == 0 {
        return Err(ValidationError::new("height", "must be greater than 0"));
    }
    Ok(metadata)
}

fn check_timestamp(field: &str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::new(field, format!("must be a finite number >= 0, got {value}")));
    }
    Ok(())
}

fn check_confidence(field: &str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::new(field, format!("must be within [0, 1], got {value}")));
    }
    Ok(())
}

fn check_bbox(index: usize, bbox: &BoundingBox) -> ValidationResult<()> {
    for (name, value) in [("width", bbox.width), ("height", bbox.height)] {
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::new(
                format!("objects[{index}].bbox.{name}"),
                "must be a finite number >= 0",
            ));
        }
    }
    if !bbox.x.is_finite() || !bbox.y.is_finite() {
        return Err(ValidationError::new(
            format!("objects[{index}].bbox"),
            "coordinates must be finite",
        ));
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> ValidationResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn require_str(object: &Map<String, Value>, field: &str) -> ValidationResult<String> {
    optional_str(object, field)?.ok_or_else(|| ValidationError::new(field, "is required"))
}

fn optional_str(object: &Map<String, Value>, field: &str) -> ValidationResult<Option<String>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(ValidationError::new(field, "must be a string")),
    }
}

fn require_number(object: &Map<String, Value>, field: &str) -> ValidationResult<f64> {
    optional_number(object, field)?.ok_or_else(|| ValidationError::new(field, "is required"))
}

fn optional_number(object: &Map<String, Value>, field: &str) -> ValidationResult<Option<f64>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| ValidationError::new(field, "must be a number")),
    }
}

fn require_dimension(object: &Map<String, Value>, field: &str) -> ValidationResult<u32> {
    optional_dimension(object, field)?.ok_or_else(|| ValidationError::new(field, "is required"))
}

fn optional_dimension(object: &Map<String, Value>, field: &str) -> ValidationResult<Option<u32>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .map(Some)
            .ok_or_else(|| ValidationError::new(field, "must be a positive integer")),
    }
}

fn parse_objects(object: &Map<String, Value>) -> ValidationResult<Vec<DetectedObject>> {
    let entries = match object.get("objects") {
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(ValidationError::new("objects", "must be a list")),
        None => return Err(ValidationError::new("objects", "is required")),
    };

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let entry = entry.as_object().ok_or_else(|| {
                ValidationError::new(format!("objects[{index}]"), "must be a JSON object")
            })?;
            let class_name = optional_str(entry, "class_name")
                .map_err(|err| nested(index, err))?
                .ok_or_else(|| {
                    ValidationError::new(format!("objects[{index}].class_name"), "is required")
                })?;
            let confidence = optional_number(entry, "confidence")
                .map_err(|err| nested(index, err))?
                .ok_or_else(|| {
                    ValidationError::new(format!("objects[{index}].confidence"), "is required")
                })?;
            let bbox = match entry.get("bbox") {
                None | Some(Value::Null) => None,
                Some(raw) => Some(serde_json::from_value::<BoundingBox>(raw.clone()).map_err(
                    |err| ValidationError::new(format!("objects[{index}].bbox"), err.to_string()),
                )?),
            };
            Ok(DetectedObject {
                class_name,
                confidence,
                bbox,
            })
        })
        .collect()
}

fn nested(index: usize, err: ValidationError) -> ValidationError {
    ValidationError::new(format!("objects[{index}].{}", err.field), err.reason)
}
