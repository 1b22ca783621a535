// ABOUTME: Library side of the codebridge binary - logging setup and the terminal REPL
// ABOUTME: Engine and dispatch live in the codebridge-agent and codebridge-core crates

pub mod logging;
pub mod repl;
