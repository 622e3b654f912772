pub mod batch;
pub mod cache;
pub mod decode;
pub mod error;
pub mod filter;
pub mod inspect;
pub mod pipeline;
pub mod record;
pub mod shards;

pub use batch::{Batch, BatchAssembler, BatchFeatures, SideChannel};
pub use cache::ShuffleBuffer;
pub use decode::{DecodedExample, OutputMode, RecordDecoder};
pub use error::DataError;
pub use filter::{RejectDiagnostic, ValidityFilter, Verdict};
pub use inspect::{inspect_split, ShardSummary, SplitSummary};
pub use pipeline::{FeedOptions, FeedPipeline, PipelineStats};
pub use record::{PackedExample, ShardReader, ShardWriter};
pub use shards::{ShardLocator, ShardStream, ShufflePolicy, Split};
