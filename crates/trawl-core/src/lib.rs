pub mod budget;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod extractor;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use budget::{Budget, Deadline, FetchTimeouts};
pub use cache::MemoryAnswerCache;
pub use circuit_breaker::{CircuitBreakerConfig, DomainCircuitBreaker, DomainStatus, FailureVerdict};
pub use config::TrawlConfig;
pub use error::AppError;
pub use extractor::ConcurrentExtractor;
pub use models::{
    BatchOutcome, ExtractedPage, FailedUrl, FailureKind, FetchTarget, ResearchDigest, SearchHit,
    SlowSite, SourceDocument,
};
pub use pipeline::{PipelineConfig, SearchPipeline};
pub use report::{ExtractionEvent, ExtractionReporter, SilentReporter, TracingExtractionReporter};
pub use traits::{
    AlwaysSearch, AnalysisProvider, AnswerStore, CleanedText, Cleaner, ContextResolver, NullStore,
    PageFetcher, SearchEngine,
};
