pub mod anthropic;
pub mod cleaner;
pub mod fetcher;
pub mod forum;
pub mod llm;
pub mod search;

pub use anthropic::AnthropicProvider;
pub use cleaner::HtmlTextCleaner;
pub use fetcher::HttpPageFetcher;
pub use forum::RedditClient;
pub use llm::{AnalysisMode, OpenAiProvider};
pub use search::GoogleSearchClient;
