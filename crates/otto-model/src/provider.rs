// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{error::ProviderError, StreamEvent, StreamRequest};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// Capability interface over heterogeneous LLM APIs.
///
/// Implementations are stateless apart from endpoint configuration; the model
/// id travels in each [`StreamRequest`], so one provider instance serves
/// every per-task model override (chat, compaction, titling).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider id for status display and cheap-model selection.
    fn name(&self) -> &str;

    /// Send one completion request and return the parsed event stream.
    async fn stream(&self, req: StreamRequest) -> Result<EventStream, ProviderError>;

    /// List model ids available from this provider.
    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError>;
}
