use crate::utils::format_timestamp;

use super::intent::QueryIntent;
use super::prompt::Evidence;

const MAX_SUGGESTIONS: usize = 3;

/// One to three follow-up questions that fit what was just asked.
pub fn follow_up_suggestions(
    intent: &QueryIntent,
    evidence: &Evidence,
    known_classes: &[String],
) -> Vec<String> {
    let first_moment = evidence.timestamps().first().copied();
    let other_class = |current: Option<&str>| {
        known_classes
            .iter()
            .find(|class| Some(class.as_str()) != current)
            .cloned()
    };

    let mut suggestions: Vec<String> = match intent {
        QueryIntent::Visual => vec![
            first_moment
                .map(|t| format!("What is being said around {}?", format_timestamp(t)))
                .unwrap_or_else(|| "What is being said in the video?".into()),
            other_class(None)
                .map(|class| format!("When does the {class} appear?"))
                .unwrap_or_else(|| "What objects can be seen?".into()),
            "What happens at the end of the video?".into(),
        ],
        QueryIntent::Audio => vec![
            first_moment
                .map(|t| format!("What is happening on screen at {}?", format_timestamp(t)))
                .unwrap_or_else(|| "What can be seen in the video?".into()),
            "Summarize what is said in the video.".into(),
        ],
        QueryIntent::Object { class_name } => vec![
            format!("What is the {class_name} doing?"),
            other_class(Some(class_name.as_str()))
                .map(|class| format!("Is there a {class} in the video?"))
                .unwrap_or_else(|| "What else appears in the video?".into()),
            first_moment
                .map(|t| format!("What is said at {}?", format_timestamp(t)))
                .unwrap_or_else(|| "What is being said in the video?".into()),
        ],
        QueryIntent::Temporal { timestamp } => vec![
            format!("What happens just after {}?", format_timestamp(*timestamp)),
            format!("What is being said at {}?", format_timestamp(*timestamp)),
            "Summarize the whole video.".into(),
        ],
        QueryIntent::General => vec![
            "What happens at the start of the video?".into(),
            other_class(None)
                .map(|class| format!("Where does the {class} appear?"))
                .unwrap_or_else(|| "What objects can be seen?".into()),
            "What is being said in the video?".into(),
        ],
    };

    suggestions.dedup();
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}
