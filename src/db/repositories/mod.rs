mod context_records;
mod conversation_turns;
mod stage_runs;
mod videos;
