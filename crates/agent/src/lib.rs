//! Agent runtime: turns free-text operator requests into tool calls.
//!
//! One turn runs a fixed pipeline:
//! 1. **Classification** (`classifier`) maps text to a `{tool, args}` intent.
//! 2. **Dispatch** (`tools`) validates arguments and runs the registered
//!    handler, at most once per idempotency key for side-effecting tools.
//! 3. **Fallbacks** (`runtime`) try documentation search, then the free-form
//!    LLM, then a static capability message.
//! 4. **Composition** (`composer`) turns structured tool envelopes into text.
//! 5. **Recording** persists the turn and hands the session to `memory` for
//!    background compaction.
//!
//! Every tool invocation is traced (`trace`). The LLM is only a last-resort
//! conversational fallback; it never selects or executes tools.

pub mod classifier;
pub mod composer;
pub mod identity;
pub mod llm;
pub mod memory;
pub mod runtime;
pub mod tools;
pub mod trace;

pub use classifier::{ClassifiedIntent, IntentClassifier};
pub use composer::{compose, Capabilities, ComposedResponse};
pub use identity::{ConfiguredServiceIdentity, ServiceIdentity, ServiceIdentityResolver};
pub use llm::LlmClient;
pub use memory::{MemoryManager, MemoryPolicy};
pub use runtime::{AgentComponents, AgentRuntime, ResponseEvent, TurnRequest, TurnResponse, TurnRoute};
pub use tools::{FnTool, StaticToolProvider, Tool, ToolCatalog, ToolContext, ToolProvider, ToolRegistry};
