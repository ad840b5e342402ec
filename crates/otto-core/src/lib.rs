// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod repair;
mod retry;
mod task_tool;
mod tasks;
#[cfg(test)]
mod tests;

pub use agent::{AgentOptions, AgentService, TaskModels, MAX_ITERATIONS};
pub use compact::{
    apply_compaction, plan_compaction, serialize_dropped, CompactionPlan, COMPACTION_ACK,
    COMPACTION_KEEP_TAIL, COMPACTION_TOKEN_THRESHOLD,
};
pub use events::AgentEvent;
pub use repair::repair_transcript;
pub use retry::{is_retryable, retry_message, RetryAttempt, RetrySchedule, MAX_ATTEMPTS};
pub use task_tool::TaskTool;
