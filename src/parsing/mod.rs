pub mod response_parser;

// Re-export the main parsing function for convenience
pub use response_parser::parse_likert_responses;
