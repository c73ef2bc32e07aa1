use anyhow::Context;
use keywarden_client::entities::logger::{
  LogConfig, StdioLogMode,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initialize the global tracing subscriber from the given config.
/// Must be called once in app startup, before any logs are emitted.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let level: tracing::Level = config.level.into();

  let registry = tracing_subscriber::registry()
    .with(LevelFilter::from_level(level));

  match config.stdio {
    StdioLogMode::Standard => {
      if config.pretty {
        registry
          .with(tracing_subscriber::fmt::layer().pretty())
          .try_init()
      } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
      }
    }
    StdioLogMode::Json => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    StdioLogMode::None => registry.try_init(),
  }
  .context("failed to init tracing subscriber")
}
