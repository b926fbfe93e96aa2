pub mod archive;
pub mod clean;
pub mod compdb;
pub mod compile;
pub mod context;
pub mod ctags;
pub mod exec;
pub mod feedback;
pub mod includes;
pub mod options;
pub mod phases;
pub mod prototypes;
pub mod recipe;
pub mod setup;
pub mod types;
pub mod uptodate;

pub use context::{Console, Context};
pub use feedback::FeedbackAnalyzer;
pub use recipe::RecipeByPrefixSuffix;
pub use types::{Command, Origin, SourceFile, run_commands};
