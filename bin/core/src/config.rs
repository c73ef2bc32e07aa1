use std::{fs::read_to_string, sync::OnceLock};

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use keywarden_client::entities::config::{
  CliArgs, CoreConfig, Env,
};

pub fn core_args() -> &'static CliArgs {
  static CORE_ARGS: OnceLock<CliArgs> = OnceLock::new();
  CORE_ARGS.get_or_init(CliArgs::parse)
}

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse core environment");
    let args = core_args();

    let config_path = args
      .config_path
      .as_ref()
      .or(env.keywarden_config_path.as_ref());

    let mut config = match config_path {
      Some(path) => read_to_string(path)
        .with_context(|| {
          format!("failed to read config at {}", path.display())
        })
        .and_then(|contents| {
          toml::from_str::<CoreConfig>(&contents)
            .with_context(|| {
              format!(
                "failed to parse config at {}",
                path.display()
              )
            })
        })
        .expect("invalid core config"),
      None => {
        println!(
          "{}: no config path given, using default config",
          "INFO".green(),
        );
        CoreConfig::default()
      }
    };

    if let Some(level) = args.log_level {
      config.logging.level = level.into();
    }
    config
  })
}
