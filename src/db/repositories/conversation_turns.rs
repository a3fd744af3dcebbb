use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::db::{
    connection::{Database, StoreTx},
    helpers::{parse_datetime, parse_turn_role, to_i64},
    models::ConversationTurn,
};
use crate::error::PipelineResult;

fn insert_turn(conn: &Connection, turn: &ConversationTurn) -> Result<()> {
    conn.execute(
        "INSERT INTO conversation_turns (id, video_id, role, content, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            turn.id,
            turn.video_id,
            turn.role.as_str(),
            turn.content,
            turn.timestamp.to_rfc3339(),
        ],
    )
    .context("failed to insert conversation turn")?;
    Ok(())
}

impl StoreTx<'_> {
    pub fn insert_conversation_turn(&mut self, turn: &ConversationTurn) -> Result<()> {
        insert_turn(self.connection(), turn)
    }
}

impl Database {
    pub async fn insert_conversation_turn(&self, turn: &ConversationTurn) -> PipelineResult<()> {
        let turn = turn.clone();
        self.execute_write("insert_conversation_turn", move |conn| {
            insert_turn(conn, &turn)
        })
        .await
    }

    /// Store a user message and its reply so memory never holds half an exchange.
    pub async fn insert_exchange(
        &self,
        user: &ConversationTurn,
        assistant: &ConversationTurn,
    ) -> PipelineResult<()> {
        let user = user.clone();
        let assistant = assistant.clone();
        self.transaction("insert_exchange", move |tx| {
            tx.insert_conversation_turn(&user)?;
            tx.insert_conversation_turn(&assistant)
        })
        .await
    }

    /// The last `limit` turns for a video, oldest first.
    pub async fn get_recent_turns(
        &self,
        video_id: &str,
        limit: usize,
    ) -> PipelineResult<Vec<ConversationTurn>> {
        let video_id = video_id.to_string();
        self.read("get_recent_turns", move |conn| {
            let limit = to_i64(limit as u64)?;
            let mut stmt = conn.prepare(
                "SELECT id, video_id, role, content, created_at
                FROM conversation_turns
                WHERE video_id = ?1
                ORDER BY seq DESC
                LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![video_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut turns = Vec::new();
            for row in rows {
                let (id, video_id, role, content, created_at) = row?;
                turns.push(ConversationTurn {
                    id,
                    video_id,
                    role: parse_turn_role(&role)?,
                    content,
                    timestamp: parse_datetime(&created_at, "created_at")?,
                });
            }
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    pub async fn delete_turns(&self, video_id: &str) -> PipelineResult<u64> {
        let video_id = video_id.to_string();
        self.execute_write("delete_turns", move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM conversation_turns WHERE video_id = ?1",
                    params![video_id],
                )
                .context("failed to delete conversation turns")?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::models::{TurnRole, Video};

    async fn seeded() -> Database {
        let db = Database::in_memory().unwrap();
        db.upsert_video(&Video::new(
            "v1".into(),
            "clip.mp4".into(),
            "/tmp/clip.mp4".into(),
            Utc::now(),
        ))
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn recent_turns_are_capped_and_in_append_order() {
        let db = seeded().await;
        for index in 0..6 {
            db.insert_exchange(
                &ConversationTurn::user("v1", format!("question {index}")),
                &ConversationTurn::assistant("v1", format!("answer {index}")),
            )
            .await
            .unwrap();
        }

        let turns = db.get_recent_turns("v1", 4).await.unwrap();
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["question 4", "answer 4", "question 5", "answer 5"]
        );
        assert_eq!(turns[0].role, TurnRole::User);
    }

    #[tokio::test]
    async fn reset_empties_memory() {
        let db = seeded().await;
        db.insert_conversation_turn(&ConversationTurn::user("v1", "hi"))
            .await
            .unwrap();
        assert_eq!(db.delete_turns("v1").await.unwrap(), 1);
        assert!(db.get_recent_turns("v1", 10).await.unwrap().is_empty());
    }
}
