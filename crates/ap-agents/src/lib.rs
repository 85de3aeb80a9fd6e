//! Agent side of auto-pilot: the reasoning-engine port, the Claude CLI
//! engine, prompt assembly, and the session orchestrator that the task
//! queue calls for every task.

pub mod claude_cli;
pub mod engine;
pub mod orchestrator;
pub mod prompts;
pub mod tool_index;
pub mod transcript;
