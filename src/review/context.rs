use crate::core::config::BotConfig;
use crate::core::error::SignbotError;
use crate::review::aggregate::PolicyTable;
use crate::review::classifier::CommentClassifier;
use crate::review::codec::CacheCodec;
use crate::review::commands::CommandRegistry;
use crate::review::directory::CategoryDirectory;

/// Everything a run needs that does not come from the forge.
///
/// Built once from the config and shared read-only by every request the
/// process handles. Per-request mutable state (assignments, the cache) is
/// cloned out of it by the pipeline.
pub struct Context {
    pub config: BotConfig,
    pub directory: CategoryDirectory,
    pub classifier: CommentClassifier,
    pub policy: PolicyTable,
    pub codec: CacheCodec,
}

impl Context {
    pub fn new(config: BotConfig) -> Result<Self, SignbotError> {
        Self::with_registry(config, CommandRegistry::standard())
    }

    pub fn with_registry(
        config: BotConfig,
        registry: CommandRegistry,
    ) -> Result<Self, SignbotError> {
        config.validate()?;
        let directory = CategoryDirectory::from_config(&config)?;
        let policy = PolicyTable::from_config(&config)?;
        let classifier = CommentClassifier::new(&config.bot_login, registry);
        let codec = CacheCodec::new(config.cache.chunk_threshold);
        Ok(Self {
            config,
            directory,
            classifier,
            policy,
            codec,
        })
    }
}
