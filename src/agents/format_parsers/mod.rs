// Agent-specific format parsers for processing CLI output
//
// Each parser turns one line of an agent CLI's stdout into zero or more
// AgentEvents. Only the Claude Code CLI is driven today.

pub mod claude;

pub use claude::ClaudeStreamParser;
