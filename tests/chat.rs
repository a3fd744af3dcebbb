mod common;

use std::sync::Arc;

use common::{start, FakeLanguageModel, Fakes, Gate};
use framechat::db::TurnRole;
use framechat::{PipelineError, QueryIntent};

#[tokio::test(flavor = "multi_thread")]
async fn temporal_question_finds_the_spoken_segment() {
    let app = start(Fakes::default());
    let video_id = app.upload_processed().await;

    let reply = app
        .assistant
        .chat("what did they say at 0:45", &video_id)
        .await
        .unwrap();

    assert_eq!(reply.intent, QueryIntent::Temporal { timestamp: 45.0 });
    assert!(!reply.fallback);
    assert_eq!(reply.message_text, "Here is what happens in the video.");
    assert!(reply.timestamps.contains(&40.0));
    assert!(reply.timestamps.iter().all(|t| (35.0..=50.0).contains(t)));
    assert!(!reply.frame_refs.is_empty());
    assert!((1..=3).contains(&reply.suggestions.len()));

    let prompt = app.llm.last_prompt().unwrap();
    assert!(prompt.contains("[0:40-0:50] hello world"));
    assert!(prompt.ends_with("Question: what did they say at 0:45\nAnswer:"));
}

#[tokio::test(flavor = "multi_thread")]
async fn object_question_returns_sightings() {
    let app = start(Fakes::default());
    let video_id = app.upload_processed().await;

    let reply = app.assistant.chat("where is the dog?", &video_id).await.unwrap();
    assert_eq!(
        reply.intent,
        QueryIntent::Object {
            class_name: "dog".into()
        }
    );
    assert_eq!(reply.timestamps, vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0]);
    assert!(reply.frame_refs.iter().all(|path| path.ends_with(".jpg")));

    let prompt = app.llm.last_prompt().unwrap();
    assert!(prompt.contains("Detected objects:"));
    assert!(!prompt.contains("person"));
}

#[tokio::test(flavor = "multi_thread")]
async fn every_exchange_is_remembered_until_reset() {
    let app = start(Fakes::default());
    let video_id = app.upload_processed().await;

    app.assistant.chat("where is the dog?", &video_id).await.unwrap();
    app.assistant.chat("what happens at 0:10?", &video_id).await.unwrap();

    let turns = app
        .assistant
        .database()
        .get_recent_turns(&video_id, 10)
        .await
        .unwrap();
    let roles: Vec<_> = turns.iter().map(|turn| turn.role).collect();
    assert_eq!(
        roles,
        vec![TurnRole::User, TurnRole::Assistant, TurnRole::User, TurnRole::Assistant]
    );
    assert_eq!(turns[0].content, "where is the dog?");

    let prompt = app.llm.last_prompt().unwrap();
    assert!(prompt.starts_with("Conversation so far:\nUser: where is the dog?"));

    assert_eq!(app.assistant.reset_memory(&video_id).await.unwrap(), 4);
    let turns = app
        .assistant
        .database()
        .get_recent_turns(&video_id, 10)
        .await
        .unwrap();
    assert!(turns.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn model_failure_falls_back_to_a_digest() {
    let app = start(Fakes {
        llm: Arc::new(FakeLanguageModel {
            broken: true,
            ..FakeLanguageModel::default()
        }),
        ..Fakes::default()
    });
    let video_id = app.upload_processed().await;

    let reply = app
        .assistant
        .chat("what did they say at 0:45", &video_id)
        .await
        .unwrap();
    assert!(reply.fallback);
    assert!(reply.message_text.contains("Here is what the video data shows"));
    assert!(reply.message_text.contains("hello world"));
}

#[tokio::test(flavor = "multi_thread")]
async fn questions_during_processing_carry_a_notice() {
    let gate = Gate::closed();
    let app = start(Fakes::gated(&gate));
    let video_id = app.upload().await;

    let reply = app
        .assistant
        .chat("what did they say about the picnic?", &video_id)
        .await
        .unwrap();
    assert_eq!(reply.intent, QueryIntent::Audio);
    assert!(reply.fallback);
    assert!(reply.message_text.starts_with("This video is still being processed"));

    // Only frames exist yet, so the overview lists sampled frame times.
    let prompt = app.llm.last_prompt().unwrap();
    assert!(prompt.contains("Note: This video is still being processed"));
    assert!(prompt.contains("Sampled frames:"));

    gate.open();
    app.assistant.wait_for_processing(&video_id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timestamp_past_the_end_is_answered_with_a_hint() {
    let app = start(Fakes::default());
    let video_id = app.upload_processed().await;

    let reply = app
        .assistant
        .chat("what happens at 1:30?", &video_id)
        .await
        .unwrap();
    assert!(reply.message_text.contains("past the end of the video"));
    assert!(reply.message_text.contains("the nearest valid time is 1:00"));
    assert!(app.llm.last_prompt().is_none());

    let turns = app
        .assistant
        .database()
        .get_recent_turns(&video_id, 10)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_messages_are_not_stored() {
    let app = start(Fakes::default());
    let video_id = app.upload_processed().await;

    let reply = app.assistant.chat("   ", &video_id).await.unwrap();
    assert_eq!(
        reply.message_text,
        "Please ask a question about the video, for example: what happens at 0:30?"
    );

    let turns = app
        .assistant
        .database()
        .get_recent_turns(&video_id, 10)
        .await
        .unwrap();
    assert!(turns.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_videos_are_rejected() {
    let app = start(Fakes::default());
    let err = app.assistant.chat("hello", "missing").await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
}
