pub mod anthropic;
pub mod anthropic_stream;
pub mod completions;
