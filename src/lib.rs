//! Convoy: a streaming, tool-using LLM conversation loop.
//!
//! One [`ConversationLoopController`](agent_loop::ConversationLoopController)
//! drives a session through model turns and tool calls over either wire
//! protocol, gating calls through a [`PermissionGate`](agent_loop::PermissionGate).
//! Hosts normally talk to a [`RunnerDispatcher`](runner::RunnerDispatcher).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use convoy::prelude::*;
//! use futures::StreamExt;
//!
//! # async fn example() -> convoy::error::Result<()> {
//! let config = AgentConfig::load()?;
//! let tools = ToolSet::new().with(AgentTool::new(
//!     "echo",
//!     "Echo the input text",
//!     ToolParameters::object().string("text", "Text to echo", true).build(),
//!     |args: ToolArguments| async move { Ok(args["text"].clone()) },
//! ));
//! let factory = ProtocolBackendFactory::new(config, Arc::new(tools))?;
//! let session = ConversationSession::new("s1", "gpt-4o", WireProtocol::ChatCompletions);
//! let dispatcher = RunnerDispatcher::new(session, Arc::new(factory));
//!
//! let mut events = dispatcher.stream_run("Say hi through the echo tool", Vec::new(), None);
//! while let Some(event) = events.next().await {
//!     if let StreamEvent::TextDelta { content } = event {
//!         print!("{content}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod prelude;
pub mod protocol;
pub mod runner;
pub mod stream;
pub mod tools;
pub mod transport;
pub mod types;
pub mod util;
